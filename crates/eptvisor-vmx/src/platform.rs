//! Collaborator interfaces to the host operating system and the processor.
//!
//! The hypervisor never executes privileged instructions or touches OS
//! structures directly. Everything goes through the traits below, which a
//! driver implements on top of its kernel and a small assembly layer, and
//! which the tests implement with a simulated machine.

use eptvisor_arch_amd64::{
    Cr0, Cr3, Cr4, CpuidResult, EptPointer, Gdtr, Idtr, InveptType, Rflags, Selector, VmcsField,
    VmxFailure,
};
use eptvisor_core::{FatalCondition, HvError, Pa, ProcessId, Va};

/// A contiguous range of populated physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRange {
    /// First byte of the range.
    pub start: Pa,

    /// Length of the range in bytes.
    pub length: u64,
}

impl PhysicalRange {
    /// Returns the address one past the last byte of the range.
    pub fn end(&self) -> Pa {
        self.start + self.length
    }
}

/// Access to host memory.
pub trait HostMemory {
    /// Returns the physical address backing the host virtual address `va`.
    ///
    /// Used to publish EPT tables, shadow pages and VMX regions to the
    /// processor.
    fn host_physical_address(&self, va: Va) -> Option<Pa>;

    /// Reads physical memory.
    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), HvError>;

    /// Reads virtual memory of the current address space.
    fn read_virtual(&self, va: Va, buffer: &mut [u8]) -> Result<(), HvError>;

    /// Returns the populated RAM ranges.
    fn physical_memory_ranges(&self) -> Vec<PhysicalRange>;
}

/// Process address-space queries.
pub trait AddressSpace {
    /// Translates `va` in the address space of process `pid`.
    fn translate(&self, pid: ProcessId, va: Va) -> Option<Pa>;

    /// Translates `va` through the paging structures rooted at `cr3`.
    fn translate_with(&self, cr3: Cr3, va: Va) -> Option<Pa>;

    /// Returns the process issuing the current request.
    fn current_process_id(&self) -> ProcessId;

    /// Returns the directory base of the process running on this core.
    fn current_process_cr3(&self) -> Cr3;

    /// Returns the directory base of the system process.
    fn system_cr3(&self) -> Cr3;
}

/// The segment registers captured at launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRegister {
    /// Extra data segment.
    Es,
    /// Code segment.
    Cs,
    /// Stack segment.
    Ss,
    /// Data segment.
    Ds,
    /// FS segment.
    Fs,
    /// GS segment.
    Gs,
    /// Task register.
    Tr,
    /// Local descriptor table register.
    Ldtr,
}

/// Non-VMX processor state and instructions of the current core.
pub trait Processor {
    /// Executes CPUID.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Executes RDMSR.
    fn read_msr(&self, msr: u32) -> u64;

    /// Executes WRMSR.
    fn write_msr(&self, msr: u32, value: u64);

    /// Reads CR0.
    fn read_cr0(&self) -> Cr0;
    /// Writes CR0.
    fn write_cr0(&self, value: Cr0);
    /// Reads CR3.
    fn read_cr3(&self) -> Cr3;
    /// Writes CR3.
    fn write_cr3(&self, value: Cr3);
    /// Reads CR4.
    fn read_cr4(&self) -> Cr4;
    /// Writes CR4.
    fn write_cr4(&self, value: Cr4);

    /// Writes CR2, the faulting address reported with #PF.
    fn write_cr2(&self, value: Va);

    /// Reads DR7.
    fn read_dr7(&self) -> u64;

    /// Stores the GDTR.
    fn sgdt(&self) -> Gdtr;
    /// Stores the IDTR.
    fn sidt(&self) -> Idtr;
    /// Loads the GDTR.
    fn lgdt(&self, gdtr: &Gdtr);
    /// Loads the IDTR.
    fn lidt(&self, idtr: &Idtr);

    /// Returns the selector currently loaded in `register`.
    fn segment_selector(&self, register: SegmentRegister) -> Selector;

    /// Reads RFLAGS.
    fn rflags(&self) -> Rflags;

    /// Writes back and invalidates all caches.
    fn wbinvd(&self);

    /// Executes XSETBV.
    fn xsetbv(&self, xcr: u32, value: u64);

    /// Halts the system. Never returns.
    fn bugcheck(&self, condition: FatalCondition) -> !;
}

/// Stack and flags of the code that started the launch.
///
/// The guest resumes with this stack at the launch trampoline, which
/// returns into the enable routine as if VMLAUNCH had returned normally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LaunchContext {
    /// Stack pointer at the point of capture.
    pub rsp: u64,

    /// Flags at the point of capture.
    pub rflags: Rflags,
}

/// VMX instructions and the assembly entry points.
pub trait VmxOperations {
    /// Enters VMX root operation with the VMXON region at `region`.
    fn vmxon(&self, region: Pa) -> Result<(), VmxFailure>;

    /// Clears the VMCS at `vmcs`.
    fn vmclear(&self, vmcs: Pa) -> Result<(), VmxFailure>;

    /// Makes the VMCS at `vmcs` current.
    fn vmptrld(&self, vmcs: Pa) -> Result<(), VmxFailure>;

    /// Launches the guest.
    ///
    /// Returns `Ok` once the core is running as a guest at the launch
    /// trampoline.
    fn vmlaunch(&self) -> Result<(), VmxFailure>;

    /// Reads a field of the current VMCS.
    fn vmread(&self, field: VmcsField) -> u64;

    /// Writes a field of the current VMCS.
    fn vmwrite(&self, field: VmcsField, value: u64);

    /// Leaves VMX operation.
    fn vmxoff(&self);

    /// Invalidates cached EPT translations.
    fn invept(&self, typ: InveptType, eptp: EptPointer);

    /// Captures the caller's stack pointer and flags.
    fn capture_context(&self) -> LaunchContext;

    /// Host address of the trampoline the guest starts at after VMLAUNCH.
    fn launch_trampoline(&self) -> Va;

    /// Host address of the trampoline that saves the guest registers and
    /// calls into the dispatcher on every VM exit.
    fn exit_trampoline(&self) -> Va;
}

/// A routine run on one logical processor by the [`ProcessorDispatch`].
pub trait CoreRoutine: Sync {
    /// Runs the routine on the processor `core`. The caller guarantees the
    /// routine executes on that processor.
    fn run(&self, core: usize) -> Result<(), HvError>;
}

/// Runs work on specific logical processors.
pub trait ProcessorDispatch {
    /// Returns the number of logical processors.
    fn processor_count(&self) -> usize;

    /// Returns the index of the processor executing the caller.
    fn current_processor(&self) -> usize;

    /// Runs `routine` on processor `core` and blocks until it completes.
    fn run_on(&self, core: usize, routine: &dyn CoreRoutine) -> Result<(), HvError>;
}

/// Everything the hypervisor needs from its environment.
pub trait Platform:
    HostMemory + AddressSpace + Processor + VmxOperations + ProcessorDispatch + Sync
{
}

impl<T> Platform for T where
    T: HostMemory + AddressSpace + Processor + VmxOperations + ProcessorDispatch + Sync
{
}
