/// Kernel dispatch: CPU reference vs externally registered accelerated
/// kernels, resolved per device kind.
///
/// The registry is an explicit object (one process-wide instance via
/// `KernelRegistry::global()`, fresh instances constructible for tests)
/// rather than a hidden mutable map. Each device kind owns one lazily
/// initialized slot; `OnceLock` guarantees that concurrent first
/// resolutions cannot construct two distinct entries. The cache key is the
/// device KIND — device indices never reach the registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::alignment::{AlignmentKernel, CpuKernel};

/// Execution device family. Closed enumeration: the registry is keyed by
/// kind, never by a specific device index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 2] = [DeviceKind::Cpu, DeviceKind::Cuda];

    fn slot_index(self) -> usize {
        match self {
            DeviceKind::Cpu => 0,
            DeviceKind::Cuda => 1,
        }
    }
}

/// Error for registration attempts against an occupied slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchError {
    /// A kernel was already registered, or the slot was already resolved
    /// (and thereby memoized a fallback) for this device kind.
    AlreadyBound(DeviceKind),
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::AlreadyBound(kind) => write!(
                f,
                "a kernel is already bound for device kind {kind:?}; register before first resolve"
            ),
        }
    }
}

/// Process-wide override: route every resolve to the CPU reference,
/// bypassing registered accelerated kernels. Used for parity debugging.
static FORCE_CPU: AtomicBool = AtomicBool::new(false);

pub fn force_cpu_reference(on: bool) {
    FORCE_CPU.store(on, Ordering::SeqCst);
}

pub fn is_cpu_forced() -> bool {
    FORCE_CPU.load(Ordering::SeqCst)
}

fn cpu_reference() -> Arc<dyn AlignmentKernel> {
    static CPU: OnceLock<Arc<dyn AlignmentKernel>> = OnceLock::new();
    CPU.get_or_init(|| Arc::new(CpuKernel)).clone()
}

/// Per-kind kernel registry with lazy single initialization.
pub struct KernelRegistry {
    slots: [OnceLock<Arc<dyn AlignmentKernel>>; 2],
}

impl KernelRegistry {
    pub const fn new() -> Self {
        KernelRegistry { slots: [OnceLock::new(), OnceLock::new()] }
    }

    /// The process-wide registry used by the attention layer by default.
    pub fn global() -> &'static KernelRegistry {
        static GLOBAL: KernelRegistry = KernelRegistry::new();
        &GLOBAL
    }

    /// Bind an accelerated kernel for a device kind. Must happen before the
    /// first `resolve` of that kind; afterwards the slot is immutable.
    pub fn register(
        &self,
        kind: DeviceKind,
        kernel: Arc<dyn AlignmentKernel>,
    ) -> Result<(), DispatchError> {
        self.slots[kind.slot_index()]
            .set(kernel)
            .map_err(|_| DispatchError::AlreadyBound(kind))
    }

    /// Resolve the kernel for a device kind. First resolution memoizes;
    /// repeated lookups are O(1). A kind with no registered kernel falls
    /// back to the CPU reference, which is always correct.
    pub fn resolve(&self, kind: DeviceKind) -> Arc<dyn AlignmentKernel> {
        if is_cpu_forced() {
            return cpu_reference();
        }
        self.slots[kind.slot_index()]
            .get_or_init(|| match kind {
                DeviceKind::Cpu => Arc::new(CpuKernel),
                // No accelerated kernel registered for this kind.
                DeviceKind::Cuda => cpu_reference(),
            })
            .clone()
    }

    /// Whether the slot for a kind has been bound (registered or resolved).
    pub fn is_bound(&self, kind: DeviceKind) -> bool {
        self.slots[kind.slot_index()].get().is_some()
    }
}

impl Default for KernelRegistry {
    fn default() -> Self {
        KernelRegistry::new()
    }
}
