//! A simulated machine implementing every platform trait.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use eptvisor_arch_amd64::{
    Cr0, Cr3, Cr4, CpuidResult, EptPointer, GIB, Gdtr, Idtr, InveptType, Rflags, Selector,
    VmcsField, VmxFailure, msr,
};
use eptvisor_core::{FatalCondition, HvError, PAGE_SIZE, Pa, ProcessId, Va};

use crate::{
    exit::{CONTROL_LEAF, HYPERVISOR_SIGNATURE, SHUTDOWN_SUBLEAF, SYSCALL_HOOKS_SUBLEAF},
    platform::{
        AddressSpace, CoreRoutine, HostMemory, LaunchContext, PhysicalRange, Processor,
        ProcessorDispatch, SegmentRegister, VmxOperations,
    },
};

///////////////////////////////////////////////////////////////////////////////
// Mock Machine
///////////////////////////////////////////////////////////////////////////////

pub(crate) const LAUNCH_TRAMPOLINE: Va = Va(0xffff_f800_0010_0000);
pub(crate) const EXIT_TRAMPOLINE: Va = Va(0xffff_f800_0010_1000);
pub(crate) const LAUNCH_RSP: u64 = 0xffff_f880_0200_7f00;
pub(crate) const SYSTEM_CR3: Cr3 = Cr3(0x1ad000);
pub(crate) const GDT_BASE: u64 = 0xffff_f800_0020_0000;

#[derive(Default)]
struct MockCore {
    vmx_on: bool,
    virtualized: bool,
    stuck: bool,
    fail_vmxon: bool,
    fail_vmlaunch: Option<u32>,
    vmcs: HashMap<u32, u64>,
    cr0: u64,
    cr3: u64,
    cr4: u64,
    cr2: u64,
    gdtr: Gdtr,
    idtr: Idtr,
}

#[derive(Default)]
struct MockState {
    physical: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    virtual_memory: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
    ranges: Vec<PhysicalRange>,
    processes: HashMap<(ProcessId, u64), Pa>,
    directories: HashMap<(u64, u64), Pa>,
    current_pid: ProcessId,
    current_cr3: Cr3,
    msrs: HashMap<u32, u64>,
    cpuid: HashMap<(u32, u32), CpuidResult>,
    cores: Vec<MockCore>,
    invept: Vec<(usize, InveptType, EptPointer)>,
    wbinvd: usize,
    xsetbv: Vec<(u32, u64)>,
    syscall_hook_requests: Vec<usize>,
}

pub(crate) struct MockPlatform {
    state: Mutex<MockState>,
    current: AtomicUsize,
}

impl MockPlatform {
    /// Creates a VMX-capable machine with `cores` processors and 1GiB of RAM.
    pub(crate) fn new(cores: usize) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .try_init();

        let mut state = MockState {
            ranges: vec![PhysicalRange {
                start: Pa(0x1000),
                length: GIB - 0x1000,
            }],
            current_pid: ProcessId(4),
            current_cr3: SYSTEM_CR3,
            ..MockState::default()
        };

        state.msrs.insert(msr::IA32_FEATURE_CONTROL, 0b101);
        state.msrs.insert(msr::IA32_MTRRCAP, 0);
        state
            .msrs
            .insert(msr::IA32_VMX_BASIC, 1 | 0x1000 << 32 | 6 << 50 | 1 << 55);
        for index in [
            msr::IA32_VMX_PINBASED_CTLS,
            msr::IA32_VMX_PROCBASED_CTLS,
            msr::IA32_VMX_EXIT_CTLS,
            msr::IA32_VMX_ENTRY_CTLS,
            msr::IA32_VMX_PROCBASED_CTLS2,
            msr::IA32_VMX_TRUE_PINBASED_CTLS,
            msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            msr::IA32_VMX_TRUE_EXIT_CTLS,
            msr::IA32_VMX_TRUE_ENTRY_CTLS,
        ] {
            state.msrs.insert(index, 0xffff_ffff_0000_0000);
        }
        state.msrs.insert(msr::IA32_VMX_CR0_FIXED0, 0x8000_0021);
        state.msrs.insert(msr::IA32_VMX_CR0_FIXED1, 0xffff_ffff);
        state.msrs.insert(msr::IA32_VMX_CR4_FIXED0, 0x2000);
        state.msrs.insert(msr::IA32_VMX_CR4_FIXED1, 0x3f_ffff);
        state
            .msrs
            .insert(msr::IA32_VMX_EPT_VPID_CAP, 1 << 6 | 1 << 14 | 1 << 16);
        state.msrs.insert(msr::IA32_STAR, 0x0023_0010_0000_0000);
        state.msrs.insert(msr::IA32_LSTAR, 0xffff_f800_0300_0000);
        state.msrs.insert(msr::IA32_FMASK, 0x4700);

        state.cpuid.insert(
            (CpuidResult::FEATURE_INFORMATION, 0),
            CpuidResult {
                ecx: CpuidResult::VMX,
                ..CpuidResult::default()
            },
        );

        state.cores = (0..cores)
            .map(|_| MockCore {
                cr0: 0x8005_0033,
                cr3: SYSTEM_CR3.0,
                cr4: 0x0035_06f8,
                gdtr: Gdtr {
                    base: GDT_BASE,
                    limit: 0x7f,
                },
                idtr: Idtr {
                    base: 0xffff_f800_0021_0000,
                    limit: 0xfff,
                },
                ..MockCore::default()
            })
            .collect();

        let platform = Self {
            state: Mutex::new(state),
            current: AtomicUsize::new(0),
        };

        platform.write_virtual(Va(GDT_BASE), &Self::flat_gdt());
        platform
    }

    /// A long-mode GDT: null, kernel code (0x10), kernel data (0x18),
    /// user data (0x2b), user code (0x33), TSS (0x40), TEB (0x53).
    fn flat_gdt() -> Vec<u8> {
        let mut gdt = vec![0u8; 0x80];
        gdt[0x10..0x18].copy_from_slice(&0x0020_9b00_0000_0000u64.to_le_bytes());
        gdt[0x18..0x20].copy_from_slice(&0x00cf_9300_0000_ffffu64.to_le_bytes());
        gdt[0x28..0x30].copy_from_slice(&0x00cf_f300_0000_ffffu64.to_le_bytes());
        gdt[0x30..0x38].copy_from_slice(&0x0020_fb00_0000_0000u64.to_le_bytes());
        gdt[0x40..0x48].copy_from_slice(&0x8b00_4000_0067u64.to_le_bytes());
        gdt[0x48..0x50].copy_from_slice(&0xffff_f800u64.to_le_bytes());
        gdt[0x50..0x58].copy_from_slice(&0x00cf_f300_0000_3c00u64.to_le_bytes());
        gdt
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn core(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub(crate) fn set_current(&self, core: usize) {
        self.current.store(core, Ordering::SeqCst);
    }

    pub(crate) fn write_physical(&self, pa: Pa, data: &[u8]) {
        let mut state = self.state();
        write_bytes(&mut state.physical, pa.0, data);
    }

    pub(crate) fn physical_bytes(&self, pa: Pa, length: usize) -> Vec<u8> {
        let state = self.state();
        let mut buffer = vec![0; length];
        read_bytes(&state.physical, pa.0, &mut buffer);
        buffer
    }

    pub(crate) fn write_virtual(&self, va: Va, data: &[u8]) {
        let mut state = self.state();
        write_bytes(&mut state.virtual_memory, va.0, data);
    }

    /// Maps the page of `va` in process `pid` to the page of `pa`.
    pub(crate) fn map_process(&self, pid: ProcessId, va: Va, pa: Pa) {
        self.state()
            .processes
            .insert((pid, va.page_base().0), pa.page_base());
    }

    /// Maps the page of `va` under the directory `cr3` to the page of `pa`.
    pub(crate) fn map_directory(&self, cr3: Cr3, va: Va, pa: Pa) {
        self.state()
            .directories
            .insert((cr3.directory_base().0, va.page_base().0), pa.page_base());
    }

    pub(crate) fn set_current_process(&self, pid: ProcessId, cr3: Cr3) {
        let mut state = self.state();
        state.current_pid = pid;
        state.current_cr3 = cr3;
    }

    pub(crate) fn set_msr(&self, index: u32, value: u64) {
        self.state().msrs.insert(index, value);
    }

    pub(crate) fn msr(&self, index: u32) -> u64 {
        self.state().msrs.get(&index).copied().unwrap_or_default()
    }

    pub(crate) fn set_cpuid(&self, leaf: u32, subleaf: u32, result: CpuidResult) {
        self.state().cpuid.insert((leaf, subleaf), result);
    }

    pub(crate) fn fail_vmxon(&self, core: usize) {
        self.state().cores[core].fail_vmxon = true;
    }

    pub(crate) fn fail_vmlaunch(&self, core: usize, code: u32) {
        self.state().cores[core].fail_vmlaunch = Some(code);
    }

    pub(crate) fn set_stuck(&self, core: usize) {
        self.state().cores[core].stuck = true;
    }

    pub(crate) fn is_virtualized(&self, core: usize) -> bool {
        self.state().cores[core].virtualized
    }

    pub(crate) fn is_vmx_on(&self, core: usize) -> bool {
        self.state().cores[core].vmx_on
    }

    pub(crate) fn vmcs(&self, core: usize, field: VmcsField) -> u64 {
        self.state().cores[core]
            .vmcs
            .get(&field.0)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn set_vmcs(&self, core: usize, field: VmcsField, value: u64) {
        self.state().cores[core].vmcs.insert(field.0, value);
    }

    pub(crate) fn invept_calls(&self) -> Vec<(usize, InveptType, EptPointer)> {
        self.state().invept.clone()
    }

    pub(crate) fn wbinvd_count(&self) -> usize {
        self.state().wbinvd
    }

    pub(crate) fn xsetbv_calls(&self) -> Vec<(u32, u64)> {
        self.state().xsetbv.clone()
    }

    pub(crate) fn syscall_hook_requests(&self) -> Vec<usize> {
        self.state().syscall_hook_requests.clone()
    }

    pub(crate) fn cr2(&self, core: usize) -> u64 {
        self.state().cores[core].cr2
    }

    pub(crate) fn gdtr(&self, core: usize) -> Gdtr {
        self.state().cores[core].gdtr
    }

    pub(crate) fn cr3(&self, core: usize) -> u64 {
        self.state().cores[core].cr3
    }
}

fn read_bytes(pages: &HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>, address: u64, buffer: &mut [u8]) {
    for (index, byte) in buffer.iter_mut().enumerate() {
        let address = address + index as u64;
        *byte = pages
            .get(&(address & !(PAGE_SIZE - 1)))
            .map(|page| page[(address & (PAGE_SIZE - 1)) as usize])
            .unwrap_or_default();
    }
}

fn write_bytes(pages: &mut HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>, address: u64, data: &[u8]) {
    for (index, &byte) in data.iter().enumerate() {
        let address = address + index as u64;
        let page = pages
            .entry(address & !(PAGE_SIZE - 1))
            .or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
        page[(address & (PAGE_SIZE - 1)) as usize] = byte;
    }
}

impl HostMemory for MockPlatform {
    fn host_physical_address(&self, va: Va) -> Option<Pa> {
        Some(Pa(va.0))
    }

    fn read_physical(&self, pa: Pa, buffer: &mut [u8]) -> Result<(), HvError> {
        let state = self.state();
        let end = pa + buffer.len() as u64;
        if !state
            .ranges
            .iter()
            .any(|range| range.start <= pa && end <= range.end())
        {
            return Err(HvError::AddressOutOfRange(pa));
        }

        read_bytes(&state.physical, pa.0, buffer);
        Ok(())
    }

    fn read_virtual(&self, va: Va, buffer: &mut [u8]) -> Result<(), HvError> {
        let state = self.state();
        read_bytes(&state.virtual_memory, va.0, buffer);
        Ok(())
    }

    fn physical_memory_ranges(&self) -> Vec<PhysicalRange> {
        self.state().ranges.clone()
    }
}

impl AddressSpace for MockPlatform {
    fn translate(&self, pid: ProcessId, va: Va) -> Option<Pa> {
        let base = self.state().processes.get(&(pid, va.page_base().0)).copied()?;
        Some(base + va.page_offset())
    }

    fn translate_with(&self, cr3: Cr3, va: Va) -> Option<Pa> {
        let base = self
            .state()
            .directories
            .get(&(cr3.directory_base().0, va.page_base().0))
            .copied()?;
        Some(base + va.page_offset())
    }

    fn current_process_id(&self) -> ProcessId {
        self.state().current_pid
    }

    fn current_process_cr3(&self) -> Cr3 {
        self.state().current_cr3
    }

    fn system_cr3(&self) -> Cr3 {
        SYSTEM_CR3
    }
}

impl Processor for MockPlatform {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        let core = self.core();
        let mut state = self.state();

        if state.cores[core].virtualized {
            if leaf == CONTROL_LEAF && subleaf == SHUTDOWN_SUBLEAF {
                if !state.cores[core].stuck {
                    let core = &mut state.cores[core];
                    core.virtualized = false;
                    core.vmx_on = false;
                }
                return CpuidResult::default();
            }

            if leaf == CONTROL_LEAF && subleaf == SYSCALL_HOOKS_SUBLEAF {
                state.syscall_hook_requests.push(core);
                return CpuidResult::default();
            }

            if leaf == CpuidResult::HYPERVISOR_INTERFACE {
                return CpuidResult {
                    eax: HYPERVISOR_SIGNATURE,
                    ..CpuidResult::default()
                };
            }

            if leaf == CpuidResult::FEATURE_INFORMATION {
                let mut result = state.cpuid.get(&(leaf, 0)).copied().unwrap_or_default();
                result.ecx |= CpuidResult::HYPERVISOR_PRESENT;
                return result;
            }
        }

        state
            .cpuid
            .get(&(leaf, subleaf))
            .or_else(|| state.cpuid.get(&(leaf, 0)))
            .copied()
            .unwrap_or_default()
    }

    fn read_msr(&self, index: u32) -> u64 {
        self.msr(index)
    }

    fn write_msr(&self, index: u32, value: u64) {
        self.set_msr(index, value);
    }

    fn read_cr0(&self) -> Cr0 {
        Cr0(self.state().cores[self.core()].cr0)
    }

    fn write_cr0(&self, value: Cr0) {
        let core = self.core();
        self.state().cores[core].cr0 = value.0;
    }

    fn read_cr3(&self) -> Cr3 {
        Cr3(self.state().cores[self.core()].cr3)
    }

    fn write_cr3(&self, value: Cr3) {
        let core = self.core();
        self.state().cores[core].cr3 = value.0;
    }

    fn read_cr4(&self) -> Cr4 {
        Cr4(self.state().cores[self.core()].cr4)
    }

    fn write_cr4(&self, value: Cr4) {
        let core = self.core();
        self.state().cores[core].cr4 = value.0;
    }

    fn write_cr2(&self, value: Va) {
        let core = self.core();
        self.state().cores[core].cr2 = value.0;
    }

    fn read_dr7(&self) -> u64 {
        0x400
    }

    fn sgdt(&self) -> Gdtr {
        self.state().cores[self.core()].gdtr
    }

    fn sidt(&self) -> Idtr {
        self.state().cores[self.core()].idtr
    }

    fn lgdt(&self, gdtr: &Gdtr) {
        let core = self.core();
        self.state().cores[core].gdtr = *gdtr;
    }

    fn lidt(&self, idtr: &Idtr) {
        let core = self.core();
        self.state().cores[core].idtr = *idtr;
    }

    fn segment_selector(&self, register: SegmentRegister) -> Selector {
        match register {
            SegmentRegister::Cs => Selector(0x10),
            SegmentRegister::Ss => Selector(0x18),
            SegmentRegister::Ds | SegmentRegister::Es | SegmentRegister::Gs => Selector(0x2b),
            SegmentRegister::Fs => Selector(0x53),
            SegmentRegister::Tr => Selector(0x40),
            SegmentRegister::Ldtr => Selector(0),
        }
    }

    fn rflags(&self) -> Rflags {
        Rflags(0x202)
    }

    fn wbinvd(&self) {
        self.state().wbinvd += 1;
    }

    fn xsetbv(&self, xcr: u32, value: u64) {
        self.state().xsetbv.push((xcr, value));
    }

    fn bugcheck(&self, condition: FatalCondition) -> ! {
        panic!("bugcheck {:#x}: {condition}", condition.code())
    }
}

impl VmxOperations for MockPlatform {
    fn vmxon(&self, _region: Pa) -> Result<(), VmxFailure> {
        let core = self.core();
        let mut state = self.state();
        if state.cores[core].fail_vmxon {
            return Err(VmxFailure::Invalid);
        }

        state.cores[core].vmx_on = true;
        Ok(())
    }

    fn vmclear(&self, _vmcs: Pa) -> Result<(), VmxFailure> {
        Ok(())
    }

    fn vmptrld(&self, _vmcs: Pa) -> Result<(), VmxFailure> {
        Ok(())
    }

    fn vmlaunch(&self) -> Result<(), VmxFailure> {
        let core = self.core();
        let mut state = self.state();
        let core = &mut state.cores[core];

        if let Some(code) = core.fail_vmlaunch {
            core.vmcs.insert(VmcsField::VmInstructionError.0, code as u64);
            return Err(VmxFailure::Valid);
        }

        core.virtualized = true;
        Ok(())
    }

    fn vmread(&self, field: VmcsField) -> u64 {
        self.vmcs(self.core(), field)
    }

    fn vmwrite(&self, field: VmcsField, value: u64) {
        self.set_vmcs(self.core(), field, value);
    }

    fn vmxoff(&self) {
        let core = self.core();
        let mut state = self.state();
        state.cores[core].vmx_on = false;
        state.cores[core].virtualized = false;
    }

    fn invept(&self, typ: InveptType, eptp: EptPointer) {
        let core = self.core();
        self.state().invept.push((core, typ, eptp));
    }

    fn capture_context(&self) -> LaunchContext {
        LaunchContext {
            rsp: LAUNCH_RSP,
            rflags: Rflags(0x202),
        }
    }

    fn launch_trampoline(&self) -> Va {
        LAUNCH_TRAMPOLINE
    }

    fn exit_trampoline(&self) -> Va {
        EXIT_TRAMPOLINE
    }
}

impl ProcessorDispatch for MockPlatform {
    fn processor_count(&self) -> usize {
        self.state().cores.len()
    }

    fn current_processor(&self) -> usize {
        self.core()
    }

    fn run_on(&self, core: usize, routine: &dyn CoreRoutine) -> Result<(), HvError> {
        let previous = self.core();
        self.set_current(core);
        let result = routine.run(core);
        self.set_current(previous);
        result
    }
}
