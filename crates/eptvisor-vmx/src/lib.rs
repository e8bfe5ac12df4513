//! EPT engine, VM-exit dispatcher and per-core VMX management.
//!
//! The [`Hypervisor`] facade ties the pieces together: it builds one
//! [`Ept`] shared by every core, virtualizes each logical processor through
//! the [`orchestrator`], and routes every VM exit to the dispatcher. All
//! contact with the host kernel and the processor goes through the traits
//! in [`platform`].

pub mod ept;
pub mod exit;
mod hypervisor;
pub mod orchestrator;
pub mod platform;
mod request;
mod vcpu;

#[cfg(test)]
mod mock;

pub use self::{
    ept::{
        AccessRing, Ept, EptStatistics, HookId, HookKind, LiveImage, Retired, Translation,
        TranslationHint, ViolationOutcome, generate_translation_hints,
    },
    exit::{
        CONTROL_LEAF, ExitAction, HYPERVISOR_SIGNATURE, SHUTDOWN_MARKER, SHUTDOWN_SUBLEAF,
        SYSCALL_HOOKS_SUBLEAF, TerminateFrame,
    },
    hypervisor::{Hypervisor, PowerTransition},
    orchestrator::{BroadcastReport, CoreFailure, broadcast, core_order},
    platform::{
        AddressSpace, CoreRoutine, HostMemory, LaunchContext, PhysicalRange, Platform, Processor,
        ProcessorDispatch, SegmentRegister, VmxOperations,
    },
    request::{HookRequest, WatchRegion, WatchRequest},
    vcpu::{CoreStatus, HOST_STACK_SIZE},
};
