use eptvisor_arch_amd64::EptEntry;
use eptvisor_core::{MemoryAccess, Pa, ProcessId};

use super::HookId;

/// An execute-only page whose data accesses are recorded.
pub(crate) struct Watchpoint {
    pub(crate) id: HookId,
    pub(crate) base: Pa,
    pub(crate) original: EptEntry,
    pub(crate) source: ProcessId,
    pub(crate) target: ProcessId,

    /// Core that disarmed the page and will re-arm it on its next monitor
    /// trap. `None` while armed.
    pub(crate) disarmed_by: Option<usize>,
}

impl Watchpoint {
    /// The entry installed while the watchpoint is armed.
    pub(crate) fn armed_entry(&self) -> EptEntry {
        self.original.with_access(MemoryAccess::X)
    }

    /// The entry installed for the single instruction that tripped it.
    pub(crate) fn disarmed_entry(&self) -> EptEntry {
        self.original.with_access(MemoryAccess::RWX)
    }
}
