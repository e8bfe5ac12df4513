//! AMD64 and Intel VMX hardware formats.
//!
//! Everything in this crate is a plain value type describing a register,
//! a table entry or a VMCS encoding. Executing the corresponding
//! instructions is left to the platform layer.

mod cpuid;
mod cr;
mod descriptor;
mod efer;
mod exit;
mod interrupt;
pub mod msr;
mod mtrr;
mod paging;
mod registers;
mod rflags;
mod segment;
mod vmcs;

pub use self::{
    cpuid::CpuidResult,
    cr::{Cr0, Cr3, Cr4},
    descriptor::{Gdtr, Idtr},
    efer::MsrEfer,
    exit::{EptViolationQualification, ExitReason, VmxFailure},
    interrupt::{ExceptionVector, InterruptionInfo, InterruptionType},
    mtrr::{MemoryType, MtrrMap, MtrrRange},
    paging::{
        EPT_ENTRY_COUNT, EptEntry, EptLevel, EptPointer, EptTable, GIB, InveptType,
        LARGE_PAGE_SIZE, pml1_index, pml2_index, pml3_index, pml4_index,
    },
    registers::GuestRegisters,
    rflags::Rflags,
    segment::{DescriptorTable, SegmentAccess, SegmentDescriptor, Selector},
    vmcs::{
        EntryControls, ExitControls, PinControls, PrimaryControls, SecondaryControls, VmcsField,
        adjust_controls,
    },
};
