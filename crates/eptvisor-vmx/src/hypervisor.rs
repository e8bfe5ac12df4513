//! The hypervisor facade.

use std::sync::atomic::{AtomicBool, Ordering};

use eptvisor_arch_amd64::GuestRegisters;
use eptvisor_core::{FatalCondition, HvError, HypervisorConfig, Pa, ProcessId, Va};

use crate::{
    ept::{
        Ept, EptStatistics, HookId, Retired, Translation, TranslationHint,
        generate_translation_hints,
    },
    exit::{ExitAction, ExitDispatcher},
    orchestrator::broadcast,
    platform::Platform,
    request::{HookRequest, WatchRequest},
    vcpu::{CoreStatus, Vcpu, check_vmx_support, is_hypervisor_present},
};

/// Set while a [`Hypervisor`] exists.
static INSTANTIATED: AtomicBool = AtomicBool::new(false);

/// Registration of the single hypervisor instance. Dropping it allows a new
/// instance to be created.
struct InstanceGuard(());

impl InstanceGuard {
    fn acquire() -> Result<Self, HvError> {
        INSTANTIATED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| HvError::AlreadyInstantiated)?;

        Ok(Self(()))
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        INSTANTIATED.store(false, Ordering::Release);
    }
}

/// A system power transition reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerTransition {
    /// The system is about to enter a sleep state.
    Sleep,

    /// The system has returned to the working state.
    Wake,
}

/// An EPT-based hooking hypervisor running on every logical processor.
///
/// Only one instance may exist at a time. Creating it virtualizes every
/// core, dropping it removes every hook and devirtualizes every core.
///
/// The EPT is shared by all cores and outlives power transitions, so hooks
/// installed before a sleep are active again after wake.
pub struct Hypervisor<P>
where
    P: Platform,
{
    platform: P,
    config: HypervisorConfig,
    vcpus: Vec<Vcpu>,
    ept: Ept,

    /// Serializes enable and disable.
    lifecycle: spin::Mutex<()>,

    /// Whether [`PowerTransition::Wake`] should re-enable the hypervisor.
    resume_after_wake: AtomicBool,

    _guard: InstanceGuard,
}

impl<P> Hypervisor<P>
where
    P: Platform,
{
    /// Creates the hypervisor and virtualizes every core.
    ///
    /// Fails with [`HvError::AlreadyInstantiated`] while another instance
    /// exists, with [`HvError::VmxNotSupported`] or [`HvError::VmxDisabled`]
    /// when the processor cannot run it, and with [`HvError::CoreEnable`]
    /// when any core failed to launch. In the last case every core has been
    /// devirtualized again.
    pub fn new(platform: P, config: HypervisorConfig) -> Result<Self, HvError> {
        let guard = InstanceGuard::acquire()?;

        check_vmx_support(&platform)?;

        let vcpus = (0..platform.processor_count()).map(Vcpu::new).collect();
        let ept = Ept::new(&platform, &config)?;

        tracing::info!(
            cores = platform.processor_count(),
            covered = ept.covered(),
            "created hypervisor"
        );

        let hypervisor = Self {
            platform,
            config,
            vcpus,
            ept,
            lifecycle: spin::Mutex::new(()),
            resume_after_wake: AtomicBool::new(false),
            _guard: guard,
        };

        hypervisor.enable()?;
        Ok(hypervisor)
    }

    /// Returns the platform the hypervisor runs on.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Returns the shared EPT.
    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    /// Returns the number of logical processors.
    pub fn processor_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Returns the lifecycle state of processor `core`.
    pub fn core_status(&self, core: usize) -> Option<CoreStatus> {
        self.vcpus.get(core).map(Vcpu::status)
    }

    ///////////////////////////////////////////////////////////////////////////
    // Lifecycle
    ///////////////////////////////////////////////////////////////////////////

    /// Virtualizes every core.
    ///
    /// Cores that already run as guests are left alone. If any core fails,
    /// every core is devirtualized before the error is returned.
    pub fn enable(&self) -> Result<(), HvError> {
        let _lifecycle = self.lifecycle.lock();

        let system_cr3 = self.platform.system_cr3();
        let (platform, ept, config, vcpus) =
            (&self.platform, &self.ept, &self.config, &self.vcpus);

        let routine = |core: usize| {
            let vcpu = vcpus.get(core).ok_or(HvError::NotFound)?;
            if vcpu.status() == CoreStatus::Running {
                return Ok(());
            }

            vcpu.enable(platform, ept, config, system_cr3)
        };

        let report = broadcast(&self.platform, self.config.enable_traversal, &routine);
        if !report.is_success() {
            tracing::error!(
                failed = report.failures.len(),
                total = report.total,
                "hypervisor failed to start, rolling back"
            );

            self.disable_cores();
            return report.into_result();
        }

        tracing::info!(cores = report.total, "hypervisor enabled");
        Ok(())
    }

    /// Devirtualizes every core.
    ///
    /// Hooks stay registered in the EPT and become active again on the next
    /// [`enable`](Self::enable).
    pub fn disable(&self) {
        let _lifecycle = self.lifecycle.lock();
        self.disable_cores();
        tracing::info!("hypervisor disabled");
    }

    fn disable_cores(&self) {
        let (platform, vcpus) = (&self.platform, &self.vcpus);

        let routine = |core: usize| {
            let vcpu = vcpus.get(core).ok_or(HvError::NotFound)?;
            vcpu.disable(platform);
            Ok(())
        };

        // Failures are logged by the broadcast. A core that cannot leave
        // VMX operation has already halted the system.
        let _ = broadcast(&self.platform, self.config.disable_traversal, &routine);
    }

    /// Checks if the current core runs as a guest of this hypervisor.
    pub fn is_enabled(&self) -> bool {
        is_hypervisor_present(&self.platform)
    }

    /// Invalidates the EPT translations cached by every running core.
    pub fn invalidate_cores(&self) {
        let (platform, ept, vcpus) = (&self.platform, &self.ept, &self.vcpus);

        let routine = |core: usize| {
            let vcpu = vcpus.get(core).ok_or(HvError::NotFound)?;
            if vcpu.status() == CoreStatus::Running {
                ept.invalidate(platform);
            }
            Ok(())
        };

        let _ = broadcast(&self.platform, self.config.enable_traversal, &routine);
    }

    /// Invalidates every core, then frees the memory the EPT no longer
    /// references.
    fn retire(&self, retired: Retired) -> usize {
        let records = retired.records();
        if !retired.is_empty() {
            self.invalidate_cores();
        }

        drop(retired);
        records
    }

    ///////////////////////////////////////////////////////////////////////////
    // Hooks
    ///////////////////////////////////////////////////////////////////////////

    /// Patches `payload` over the code at `destination` in process `target`.
    ///
    /// See [`Ept::install_hook`].
    pub fn install_hook(
        &self,
        destination: Va,
        payload: &[u8],
        source: ProcessId,
        target: ProcessId,
        hints: &[TranslationHint],
    ) -> Result<HookId, HvError> {
        let result = self
            .ept
            .install_hook(&self.platform, destination, payload, source, target, hints);

        match result {
            Ok(id) => {
                self.invalidate_cores();
                Ok(id)
            }
            Err(err) => {
                tracing::warn!(
                    core = self.platform.current_processor(),
                    %destination,
                    %err,
                    "failed to install hook"
                );
                Err(err)
            }
        }
    }

    /// Installs a hook on behalf of the calling process.
    pub fn install_hook_request(&self, request: &HookRequest) -> Result<HookId, HvError> {
        request.check()?;

        let hints = generate_translation_hints(
            &self.platform,
            request.process_id,
            request.target_address,
            request.payload.len(),
        )?;

        self.install_hook(
            request.target_address,
            &request.payload,
            self.platform.current_process_id(),
            request.process_id,
            &hints,
        )
    }

    /// Removes one hook patch.
    pub fn remove_hook(&self, id: HookId) -> Result<(), HvError> {
        let retired = self.ept.remove_hook(id)?;
        self.retire(retired);
        Ok(())
    }

    /// Makes the page at `page` execute-only and records data accesses to it.
    pub fn install_code_watch_point(
        &self,
        page: Pa,
        source: ProcessId,
        target: ProcessId,
    ) -> Result<HookId, HvError> {
        let id = self
            .ept
            .install_code_watch_point(&self.platform, page, source, target)
            .inspect_err(|err| tracing::warn!(%page, %err, "failed to install watchpoint"))?;

        self.invalidate_cores();
        Ok(id)
    }

    /// Watches every page in `pages`, invalidating the cores once.
    ///
    /// Every page is attempted. Pages installed before a failure stay
    /// installed, and the first error is returned.
    pub fn install_code_watch_points(
        &self,
        pages: &[Pa],
        source: ProcessId,
        target: ProcessId,
    ) -> Result<Vec<HookId>, HvError> {
        let mut ids = Vec::with_capacity(pages.len());
        let mut first_error = None;

        for &page in pages {
            match self
                .ept
                .install_code_watch_point(&self.platform, page, source, target)
            {
                Ok(id) => ids.push(id),
                Err(err) => {
                    tracing::warn!(%page, %err, "failed to install watchpoint");
                    first_error.get_or_insert(err);
                }
            }
        }

        self.invalidate_cores();

        match first_error {
            Some(err) => Err(err),
            None => Ok(ids),
        }
    }

    /// Watches every region of `request` on behalf of the calling process.
    pub fn install_watch_request(&self, request: &WatchRequest) -> Result<Vec<HookId>, HvError> {
        let pages = request.resolve(&self.platform)?;
        self.install_code_watch_points(
            &pages,
            self.platform.current_process_id(),
            request.process_id,
        )
    }

    /// Removes one watchpoint.
    pub fn remove_watchpoint(&self, id: HookId) -> Result<(), HvError> {
        let retired = self.ept.remove_watchpoint(id)?;
        self.retire(retired);
        Ok(())
    }

    /// Removes every hook and watchpoint.
    pub fn disable_all_hooks(&self) {
        let records = self.retire(self.ept.disable_all_hooks());
        if records > 0 {
            tracing::info!(records, "disabled all hooks");
        }
    }

    /// Removes every hook and watchpoint targeting `pid`.
    ///
    /// Returns `true` if anything was removed.
    pub fn cleanup_process(&self, pid: ProcessId) -> bool {
        self.retire(self.ept.cleanup_process(pid)) > 0
    }

    ///////////////////////////////////////////////////////////////////////////
    // Notifications
    ///////////////////////////////////////////////////////////////////////////

    /// Called once for every process that terminates.
    pub fn on_process_exit(&self, pid: ProcessId) {
        if self.cleanup_process(pid) {
            tracing::debug!(%pid, "removed hooks of exited process");
        }
    }

    /// Called around system sleep.
    ///
    /// Virtualization does not survive a sleep state. The hypervisor is
    /// disabled before sleep and re-enabled on wake if it was running.
    pub fn on_power_transition(&self, transition: PowerTransition) -> Result<(), HvError> {
        tracing::debug!(?transition, "power transition");

        match transition {
            PowerTransition::Sleep => {
                let enabled = self.is_enabled();
                self.resume_after_wake.store(enabled, Ordering::Release);
                if enabled {
                    self.disable();
                }
                Ok(())
            }
            PowerTransition::Wake => {
                if self.resume_after_wake.swap(false, Ordering::AcqRel) {
                    self.enable()?;
                }
                Ok(())
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////////
    // Diagnostics
    ///////////////////////////////////////////////////////////////////////////

    /// Returns the recorded watchpoint accesses, oldest first.
    pub fn access_records(&self) -> Vec<Va> {
        self.ept.access_records()
    }

    /// Forgets the recorded watchpoint accesses.
    pub fn clear_access_records(&self) {
        self.ept.clear_access_records();
    }

    /// Returns the EPT statistics.
    pub fn statistics(&self) -> EptStatistics {
        self.ept.statistics()
    }

    /// Walks the EPT for `gpa`.
    pub fn translate(&self, gpa: Pa) -> Option<Translation> {
        self.ept.translate(gpa)
    }

    /// Returns every hook and watchpoint with its source and target process.
    pub fn records(&self) -> Vec<(HookId, ProcessId, ProcessId)> {
        self.ept.records()
    }

    ///////////////////////////////////////////////////////////////////////////
    // VM exits
    ///////////////////////////////////////////////////////////////////////////

    /// Handles the pending VM exit of the current core.
    ///
    /// Called by the exit trampoline with the guest registers it saved.
    pub fn handle_exit(&self, registers: &mut GuestRegisters) -> ExitAction {
        let core = self.platform.current_processor();
        let Some(vcpu) = self.vcpus.get(core)
        else {
            self.platform
                .bugcheck(FatalCondition::UnknownProcessor { core });
        };

        ExitDispatcher::new(&self.platform, &self.ept, vcpu).dispatch(registers)
    }
}

impl<P> Drop for Hypervisor<P>
where
    P: Platform,
{
    fn drop(&mut self) {
        self.disable_all_hooks();
        self.disable();
    }
}

impl<P> std::fmt::Debug for Hypervisor<P>
where
    P: Platform,
{
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Hypervisor")
            .field("config", &self.config)
            .field("vcpus", &self.vcpus)
            .field("ept", &self.ept)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Mutex, MutexGuard};

    use eptvisor_arch_amd64::{GIB, VmcsField};
    use eptvisor_core::{MemoryAccess, PAGE_SIZE, Traversal};

    use super::*;
    use crate::{ept::HookKind, mock::MockPlatform, request::WatchRegion};

    /// Only one hypervisor may exist at a time.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> MutexGuard<'static, ()> {
        match SERIAL.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    const TARGET: ProcessId = ProcessId(0x1f4);
    const CODE_VA: Va = Va(0x7ff6_1234_5000);
    const CODE_PA: Pa = Pa(0x0123_4000);

    /// Basic exit reason of INVD.
    const INVD: u64 = 13;

    fn machine(cores: usize) -> MockPlatform {
        let platform = MockPlatform::new(cores);
        let content = (0..PAGE_SIZE).map(|index| index as u8).collect::<Vec<_>>();
        platform.write_physical(CODE_PA, &content);
        platform.map_process(TARGET, CODE_VA, CODE_PA);
        platform.map_process(TARGET, CODE_VA + PAGE_SIZE, CODE_PA + PAGE_SIZE);
        platform
    }

    #[test]
    fn new_enables_every_core() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(4), HypervisorConfig::default())?;
        assert!(hypervisor.is_enabled());
        assert_eq!(hypervisor.processor_count(), 4);

        for core in 0..4 {
            assert_eq!(hypervisor.core_status(core), Some(CoreStatus::Running));
            assert!(hypervisor.platform().is_virtualized(core));
            assert_eq!(
                hypervisor.platform().vmcs(core, VmcsField::EptPointer),
                hypervisor.ept().pointer().0
            );
        }

        assert_eq!(hypervisor.core_status(4), None);
        Ok(())
    }

    #[test]
    fn second_instance_is_rejected() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        assert!(matches!(
            Hypervisor::new(machine(1), HypervisorConfig::default()),
            Err(HvError::AlreadyInstantiated)
        ));

        drop(hypervisor);
        let _hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        Ok(())
    }

    #[test]
    fn unsupported_processor_is_rejected() {
        let _serial = serial();

        let platform = machine(1);
        platform.set_cpuid(1, 0, Default::default());
        assert!(matches!(
            Hypervisor::new(platform, HypervisorConfig::default()),
            Err(HvError::VmxNotSupported)
        ));

        // The registration was released.
        assert!(!INSTANTIATED.load(Ordering::Acquire));
    }

    #[test]
    fn failed_core_rolls_back_every_core() {
        let _serial = serial();

        let platform = machine(4);
        platform.fail_vmlaunch(2, 7);

        let result = Hypervisor::new(platform, HypervisorConfig::default());
        assert!(matches!(
            result,
            Err(HvError::CoreEnable {
                failed: 1,
                total: 4
            })
        ));
        assert!(!INSTANTIATED.load(Ordering::Acquire));
    }

    #[test]
    fn rollback_devirtualizes_launched_cores() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(3), HypervisorConfig::default())?;
        hypervisor.disable();

        hypervisor.platform().fail_vmxon(1);
        assert!(matches!(
            hypervisor.enable(),
            Err(HvError::CoreEnable {
                failed: 1,
                total: 3
            })
        ));

        for core in 0..3 {
            assert_eq!(hypervisor.core_status(core), Some(CoreStatus::Stopped));
            assert!(!hypervisor.platform().is_vmx_on(core));
        }
        Ok(())
    }

    #[test]
    fn disable_and_enable_again() -> Result<(), HvError> {
        let _serial = serial();

        let config = HypervisorConfig::default()
            .with_traversal(Traversal::Descending, Traversal::Ascending);
        let hypervisor = Hypervisor::new(machine(2), config)?;

        hypervisor.disable();
        assert!(!hypervisor.is_enabled());
        for core in 0..2 {
            assert_eq!(hypervisor.core_status(core), Some(CoreStatus::Stopped));
            assert!(!hypervisor.platform().is_vmx_on(core));
        }

        hypervisor.enable()?;
        assert!(hypervisor.is_enabled());

        // Enabling a running hypervisor is a no-op.
        hypervisor.enable()?;
        assert_eq!(hypervisor.core_status(1), Some(CoreStatus::Running));
        Ok(())
    }

    #[test]
    fn hook_request_installs_and_invalidates() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(2), HypervisorConfig::default())?;
        let platform = hypervisor.platform();
        platform.set_current_process(ProcessId(0x88), Default::default());

        let request = HookRequest::new(TARGET, CODE_VA + 0x10, [0xcc, 0xc3]);
        let id = hypervisor.install_hook_request(&request)?;
        assert_eq!(id.kind(), HookKind::Patch);
        assert_eq!(id.base(), CODE_PA);
        assert_eq!(hypervisor.records(), [(id, ProcessId(0x88), TARGET)]);

        // Every running core invalidated once.
        let cores = platform
            .invept_calls()
            .iter()
            .map(|(core, _, _)| *core)
            .collect::<Vec<_>>();
        assert_eq!(cores, [0, 1]);

        let translation = hypervisor.translate(CODE_PA).ok_or(HvError::NotFound)?;
        assert_eq!(translation.access, MemoryAccess::RW);

        hypervisor.remove_hook(id)?;
        assert!(hypervisor.records().is_empty());
        assert_eq!(platform.invept_calls().len(), 4);
        Ok(())
    }

    #[test]
    fn hook_request_crossing_page_is_rejected() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        let request = HookRequest::new(TARGET, CODE_VA + 0xffe, [0x90; 3]);

        assert!(matches!(
            hypervisor.install_hook_request(&request),
            Err(HvError::PageBoundary { .. })
        ));
        assert!(hypervisor.platform().invept_calls().is_empty());
        assert_eq!(hypervisor.statistics().hook_pages, 0);
        Ok(())
    }

    #[test]
    fn watch_request_installs_every_page() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        let request = WatchRequest {
            process_id: TARGET,
            regions: vec![WatchRegion {
                address: CODE_VA + 0xff0,
                length: 0x20,
            }],
        };

        let ids = hypervisor.install_watch_request(&request)?;
        assert_eq!(ids.len(), 2);
        assert_eq!(hypervisor.statistics().watchpoints, 2);
        assert_eq!(hypervisor.platform().invept_calls().len(), 1);

        let translation = hypervisor
            .translate(CODE_PA + PAGE_SIZE)
            .ok_or(HvError::NotFound)?;
        assert_eq!(translation.access, MemoryAccess::X);

        hypervisor.remove_watchpoint(ids[0])?;
        assert_eq!(hypervisor.statistics().watchpoints, 1);
        Ok(())
    }

    #[test]
    fn watch_batch_keeps_installed_pages_on_failure() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        let result = hypervisor.install_code_watch_points(
            &[CODE_PA, Pa(512 * GIB)],
            ProcessId(4),
            TARGET,
        );

        assert!(matches!(result, Err(HvError::AddressOutOfRange(_))));
        assert_eq!(hypervisor.statistics().watchpoints, 1);
        assert_eq!(hypervisor.platform().invept_calls().len(), 1);
        Ok(())
    }

    #[test]
    fn process_exit_removes_target_records() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        hypervisor.install_hook(CODE_VA, &[0xcc], ProcessId(4), TARGET, &[])?;
        hypervisor.install_code_watch_point(CODE_PA + PAGE_SIZE, ProcessId(4), TARGET)?;

        assert!(!hypervisor.cleanup_process(ProcessId(0x99)));

        hypervisor.on_process_exit(TARGET);
        assert!(hypervisor.records().is_empty());
        assert!(!hypervisor.cleanup_process(TARGET));
        Ok(())
    }

    #[test]
    fn disable_all_hooks_twice() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        hypervisor.install_hook(CODE_VA, &[0xcc], ProcessId(4), TARGET, &[])?;

        hypervisor.disable_all_hooks();
        let after_first = hypervisor.platform().invept_calls().len();
        assert_eq!(hypervisor.statistics(), EptStatistics::default());

        hypervisor.disable_all_hooks();
        assert_eq!(hypervisor.platform().invept_calls().len(), after_first);
        Ok(())
    }

    #[test]
    fn power_cycle_keeps_hooks() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(2), HypervisorConfig::default())?;
        let id = hypervisor.install_hook(CODE_VA, &[0xcc], ProcessId(4), TARGET, &[])?;

        hypervisor.on_power_transition(PowerTransition::Sleep)?;
        assert!(!hypervisor.is_enabled());
        assert_eq!(hypervisor.core_status(1), Some(CoreStatus::Stopped));

        hypervisor.on_power_transition(PowerTransition::Wake)?;
        assert!(hypervisor.is_enabled());
        assert_eq!(hypervisor.records()[0].0, id);
        Ok(())
    }

    #[test]
    fn wake_without_sleep_keeps_disabled() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(1), HypervisorConfig::default())?;
        hypervisor.disable();

        hypervisor.on_power_transition(PowerTransition::Sleep)?;
        hypervisor.on_power_transition(PowerTransition::Wake)?;
        assert!(!hypervisor.is_enabled());
        Ok(())
    }

    #[test]
    fn handle_exit_dispatches_on_current_core() -> Result<(), HvError> {
        let _serial = serial();

        let hypervisor = Hypervisor::new(machine(2), HypervisorConfig::default())?;
        let platform = hypervisor.platform();
        platform.set_current(1);
        platform.set_vmcs(1, VmcsField::ExitReason, INVD);
        platform.set_vmcs(1, VmcsField::GuestRip, 0xffff_f800_0400_0000);
        platform.set_vmcs(1, VmcsField::ExitInstructionLength, 2);

        let mut registers = GuestRegisters::default();
        assert_eq!(hypervisor.handle_exit(&mut registers), ExitAction::Resume);
        assert_eq!(platform.wbinvd_count(), 1);
        assert_eq!(
            platform.vmcs(1, VmcsField::GuestRip),
            0xffff_f800_0400_0002
        );

        platform.set_current(0);
        Ok(())
    }

    #[test]
    fn drop_releases_instance() -> Result<(), HvError> {
        let _serial = serial();

        let platform = machine(2);
        let hypervisor = Hypervisor::new(platform, HypervisorConfig::default())?;
        hypervisor.install_hook(CODE_VA, &[0xcc], ProcessId(4), TARGET, &[])?;

        drop(hypervisor);
        assert!(!INSTANTIATED.load(Ordering::Acquire));
        Ok(())
    }
}
