//! An EPT-based hooking hypervisor core for Intel VT-x.
//!
//! The crate is split into three layers:
//!
//! - [`core`] holds the architecture neutral vocabulary: addresses, access
//!   rights, configuration and errors.
//! - [`arch`] describes the AMD64/VMX hardware structures: EPT entries,
//!   MTRRs, VMCS fields, exit reasons and segment descriptors.
//! - [`vmx`] implements the hypervisor itself: the EPT engine, the VM-exit
//!   dispatcher, per-core VMX state, the cross-core orchestrator and the
//!   [`Hypervisor`] facade.

pub use eptvisor_arch_amd64 as arch;
pub use eptvisor_core as core;
pub use eptvisor_vmx as vmx;

pub use self::{
    core::{HvError, HypervisorConfig, MemoryAccess, Pa, ProcessId, Va},
    vmx::{Hypervisor, Platform},
};
