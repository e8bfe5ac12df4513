//! Per-core VMX state.

mod launch;

pub(crate) use self::launch::{check_vmx_support, is_hypervisor_present};

use std::sync::atomic::{AtomicU8, Ordering};

use eptvisor_arch_amd64::{Cr3, Gdtr, Idtr, msr::VmxCapabilities};
use eptvisor_core::{HvError, Page, Va, allocate_zeroed};
use zerocopy::FromZeros;

/// Size of the stack the exit trampoline runs on.
pub const HOST_STACK_SIZE: usize = 0x6000;

/// Lifecycle state of one logical processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CoreStatus {
    /// The core runs without virtualization.
    Stopped = 0,

    /// The core runs as a guest of the hypervisor.
    Running = 1,

    /// Enabling the core failed in a way that left its VMX state unknown.
    Corrupt = 2,
}

impl CoreStatus {
    fn from_raw(value: u8) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            _ => Self::Corrupt,
        }
    }
}

/// Stack of the exit trampoline.
#[repr(C, align(4096))]
#[derive(FromZeros)]
pub(crate) struct HostStack([u8; HOST_STACK_SIZE]);

impl HostStack {
    /// Returns the host address one past the end of the stack.
    fn top(&self) -> Va {
        Va(self.0.as_ptr_range().end as u64)
    }
}

/// Memory the processor uses while the core is in VMX operation.
///
/// None of it may move or be freed before the core has executed VMXOFF.
pub(crate) struct VmxRegions {
    pub(crate) vmxon: Box<Page>,
    pub(crate) vmcs: Box<Page>,
    pub(crate) msr_bitmap: Box<Page>,
    pub(crate) stack: Box<HostStack>,
}

impl VmxRegions {
    fn allocate() -> Result<Self, HvError> {
        Ok(Self {
            vmxon: Page::new_zeroed()?,
            vmcs: Page::new_zeroed()?,
            msr_bitmap: Page::new_zeroed()?,
            stack: allocate_zeroed()?,
        })
    }
}

/// State captured when the core was enabled, needed to leave VMX operation
/// and to adjust controls at runtime.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RestoreState {
    pub(crate) gdtr: Gdtr,
    pub(crate) idtr: Idtr,
    pub(crate) capabilities: VmxCapabilities,
    pub(crate) system_cr3: Cr3,
}

/// One logical processor.
pub(crate) struct Vcpu {
    index: usize,
    status: AtomicU8,
    regions: spin::Mutex<Option<VmxRegions>>,
    restore: spin::RwLock<RestoreState>,
}

impl Vcpu {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            status: AtomicU8::new(CoreStatus::Stopped as u8),
            regions: spin::Mutex::new(None),
            restore: spin::RwLock::new(RestoreState::default()),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn status(&self) -> CoreStatus {
        CoreStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: CoreStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn restore_state(&self) -> RestoreState {
        *self.restore.read()
    }

    /// Checks if the core owns VMX regions.
    pub(crate) fn has_regions(&self) -> bool {
        self.regions.lock().is_some()
    }
}

impl std::fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "vcpu_tests.rs"]
mod tests;
