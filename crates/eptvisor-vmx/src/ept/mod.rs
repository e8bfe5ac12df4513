//! The EPT engine.
//!
//! One [`Ept`] is shared by every core. It owns the identity map, the split
//! tables, the hook pages and the watchpoints. Mutations take spin locks in
//! a fixed order (hooks, then watchpoints, then splits) and publish their
//! result with a single atomic store of a leaf entry, so a core handling a
//! VM exit never observes a half-built record.
//!
//! Nothing here invalidates the other cores. Every mutating operation
//! returns a [`Retired`] bundle that holds the memory no longer referenced
//! by the tree. The caller drops it only after all cores have invalidated
//! their cached translations.

mod hint;
mod hook;
mod ring;
mod tree;
mod watch;

use std::sync::atomic::{AtomicU64, Ordering};

use eptvisor_arch_amd64::{EptPointer, EptTable, EptViolationQualification, InveptType, MtrrMap};
use eptvisor_core::{
    FatalCondition, HvError, HypervisorConfig, PAGE_SIZE, Page, Pa, ProcessId, Va,
};
use indexmap::IndexMap;

pub use self::{
    hint::{TranslationHint, generate_translation_hints},
    hook::{HookId, HookKind, LiveImage},
    ring::AccessRing,
    tree::Translation,
};
pub(crate) use self::hint::page_span;
use self::{
    hook::{HookPage, HookPatch, Payload},
    tree::EptTree,
    watch::Watchpoint,
};
use crate::platform::{AddressSpace, HostMemory, Processor, VmxOperations};

/// Memory detached from the EPT that may still be cached by other cores.
///
/// Dropping it frees the memory. Drop it only after every core has
/// invalidated its EPT translations.
#[must_use = "retired memory must be kept until every core has invalidated"]
#[derive(Default)]
pub struct Retired {
    records: usize,
    tables: Vec<Box<EptTable>>,
    pages: Vec<Box<Page>>,
}

impl Retired {
    /// Returns the number of hook patches and watchpoints removed.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Checks if nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.records == 0 && self.tables.is_empty() && self.pages.is_empty()
    }

    fn retire_page(&mut self, page: HookPage) {
        self.pages.push(page.shadow);
        self.pages.push(page.reference);
    }
}

impl std::fmt::Debug for Retired {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Retired")
            .field("records", &self.records)
            .field("tables", &self.tables.len())
            .field("pages", &self.pages.len())
            .finish()
    }
}

/// What an EPT violation turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    /// A hook page switched to another image.
    HookToggled(LiveImage),

    /// A watchpoint recorded the access and was disarmed until the next
    /// monitor trap.
    WatchpointHit,

    /// The page is managed but already shows the right image. Another core
    /// changed it and this core still had the old translation cached.
    Stale,

    /// The page is neither hooked nor watched.
    Unexpected,
}

/// Counters describing the current EPT state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EptStatistics {
    /// Number of pages carrying patches.
    pub hook_pages: usize,

    /// Number of patches across all pages.
    pub patches: usize,

    /// Number of watched pages.
    pub watchpoints: usize,

    /// Number of 2MiB regions split into 4KiB leaves.
    pub splits: usize,

    /// Number of image switches across all hook pages.
    pub hits: u64,
}

/// The shared EPT engine.
pub struct Ept {
    tree: EptTree,
    hooks: spin::Mutex<IndexMap<Pa, HookPage>>,
    watchpoints: spin::Mutex<IndexMap<Pa, Watchpoint>>,
    ring: spin::Mutex<AccessRing>,
    sequence: AtomicU64,
    max_hooks: usize,
    max_watchpoints: usize,
}

impl Ept {
    /// Builds the identity map over the first 512GiB of guest-physical
    /// memory, with memory types taken from the MTRRs of the current core.
    pub fn new(
        platform: &(impl HostMemory + Processor),
        config: &HypervisorConfig,
    ) -> Result<Self, HvError> {
        let mtrr = MtrrMap::read(|index| platform.read_msr(index));
        let ept = Self::with_mtrr(platform, &mtrr, config)?;

        let highest = platform
            .physical_memory_ranges()
            .iter()
            .map(|range| u64::from(range.end()))
            .max()
            .unwrap_or_default();

        if highest > ept.covered() {
            tracing::warn!(
                highest = %Pa::new(highest),
                covered = ept.covered(),
                "physical memory extends beyond the identity map"
            );
        }

        Ok(ept)
    }

    /// Builds the identity map using `mtrr` for memory types.
    pub fn with_mtrr(
        memory: &impl HostMemory,
        mtrr: &MtrrMap,
        config: &HypervisorConfig,
    ) -> Result<Self, HvError> {
        tracing::debug!(mtrr_ranges = mtrr.ranges().len(), "initializing EPT");

        Ok(Self {
            tree: EptTree::identity(memory, mtrr)?,
            hooks: spin::Mutex::new(IndexMap::new()),
            watchpoints: spin::Mutex::new(IndexMap::new()),
            ring: spin::Mutex::new(AccessRing::new(config.access_ring_capacity)),
            sequence: AtomicU64::new(1),
            max_hooks: config.max_hooks,
            max_watchpoints: config.max_watchpoints,
        })
    }

    /// Returns the EPT pointer every core loads into its VMCS.
    pub fn pointer(&self) -> EptPointer {
        self.tree.pointer()
    }

    /// Returns the number of bytes of guest-physical memory that are mapped.
    pub fn covered(&self) -> u64 {
        self.tree.covered()
    }

    /// Invalidates the cached translations of this EPT on the current core.
    pub fn invalidate(&self, vmx: &impl VmxOperations) {
        vmx.invept(InveptType::SingleContext, self.pointer());
    }

    /// Walks the EPT for `gpa`.
    pub fn translate(&self, gpa: Pa) -> Option<Translation> {
        self.tree.translate(gpa)
    }

    /// Splits the 2MiB region covering `pa` into 4KiB leaves.
    ///
    /// Returns the physical address of the leaf table. The call is
    /// idempotent.
    pub fn split_large_page(&self, memory: &impl HostMemory, pa: Pa) -> Result<Pa, HvError> {
        self.tree.split_large_page(memory, pa)
    }

    fn next_id(&self, kind: HookKind, base: Pa) -> HookId {
        HookId::new(kind, self.sequence.fetch_add(1, Ordering::Relaxed), base)
    }

    /// Installs a patch of `payload` at `destination` in the address space
    /// of `target`.
    ///
    /// The page keeps showing its real content to reads and writes. Only
    /// instruction fetches see the patched bytes. A hint whose virtual base
    /// matches the destination page is used instead of translating through
    /// the target's address space.
    pub fn install_hook(
        &self,
        platform: &(impl HostMemory + AddressSpace),
        destination: Va,
        payload: &[u8],
        source: ProcessId,
        target: ProcessId,
        hints: &[TranslationHint],
    ) -> Result<HookId, HvError> {
        if payload.is_empty() {
            return Err(HvError::EmptyPayload);
        }

        let offset = destination.page_offset();
        if offset + payload.len() as u64 > PAGE_SIZE {
            return Err(HvError::PageBoundary {
                offset,
                length: payload.len(),
            });
        }

        let hint = hints
            .iter()
            .find(|hint| hint.virtual_base == destination.page_base());

        let base = match hint {
            Some(hint) => hint.physical_base.page_base(),
            None => platform
                .translate(target, destination)
                .ok_or(HvError::TranslationFailed(destination))?
                .page_base(),
        };

        let mut content = [0u8; PAGE_SIZE as usize];
        match hint {
            Some(hint) => content.copy_from_slice(&hint.content.0),
            None => platform.read_physical(base, &mut content)?,
        }

        let mut hooks = self.hooks.lock();
        if self.watchpoints.lock().contains_key(&base) {
            return Err(HvError::PageInUse(base));
        }

        let id = self.next_id(HookKind::Patch, base);
        let patch = HookPatch {
            id,
            offset: offset as usize,
            payload: Payload::from_slice(payload),
            source,
            target,
        };

        if let Some(page) = hooks.get_mut(&base) {
            let coverage = page.coverage();
            page.resync(0, &content, &coverage);
            page.apply(&patch);
            page.patches.push(patch);

            tracing::debug!(%base, %id, patches = page.patches.len(), "added patch to hook page");
            return Ok(id);
        }

        if hooks.len() >= self.max_hooks {
            return Err(HvError::CapacityExceeded {
                kind: "hook pages",
                limit: self.max_hooks,
            });
        }

        self.tree.split_large_page(platform, base)?;
        let original = self.tree.leaf(base)?;

        let shadow = Page::from_content(&content)?;
        let reference = Page::from_content(&content)?;
        let shadow_va = Va::new(&*shadow as *const Page as u64);
        let shadow_pa = platform
            .host_physical_address(shadow_va)
            .ok_or(HvError::TranslationFailed(shadow_va))?;

        let (execute, read_write) = HookPage::images(original, shadow_pa);
        let mut page = HookPage {
            base,
            original,
            execute,
            read_write,
            live: LiveImage::ReadWrite,
            shadow,
            reference,
            patches: Vec::new(),
            hits: 0,
        };

        page.apply(&patch);
        page.patches.push(patch);

        self.tree.set_leaf(base, read_write)?;
        hooks.insert(base, page);

        tracing::debug!(%base, %id, %shadow_pa, "created hook page");
        Ok(id)
    }

    /// Makes the page at `page` execute-only and records every data access
    /// to it.
    ///
    /// Watching a page that is already watched returns the existing
    /// identifier.
    pub fn install_code_watch_point(
        &self,
        memory: &impl HostMemory,
        page: Pa,
        source: ProcessId,
        target: ProcessId,
    ) -> Result<HookId, HvError> {
        let base = page.page_base();

        let hooks = self.hooks.lock();
        if hooks.contains_key(&base) {
            return Err(HvError::PageInUse(base));
        }

        let mut watchpoints = self.watchpoints.lock();
        if let Some(watchpoint) = watchpoints.get(&base) {
            return Ok(watchpoint.id);
        }

        if watchpoints.len() >= self.max_watchpoints {
            return Err(HvError::CapacityExceeded {
                kind: "watchpoints",
                limit: self.max_watchpoints,
            });
        }

        self.tree.split_large_page(memory, base)?;
        let original = self.tree.leaf(base)?;

        let id = self.next_id(HookKind::Watch, base);
        let watchpoint = Watchpoint {
            id,
            base,
            original,
            source,
            target,
            disarmed_by: None,
        };

        self.tree.set_leaf(base, watchpoint.armed_entry())?;
        watchpoints.insert(base, watchpoint);

        tracing::debug!(%base, %id, "installed watchpoint");
        Ok(id)
    }

    /// Removes one patch.
    ///
    /// The patched bytes are restored from the reference copy. When the
    /// last patch of a page goes, the page gets its original entry back.
    /// The split stays in place.
    pub fn remove_hook(&self, id: HookId) -> Result<Retired, HvError> {
        if id.kind() != HookKind::Patch {
            return Err(HvError::NotFound);
        }

        let mut hooks = self.hooks.lock();
        let page = hooks.get_mut(&id.base()).ok_or(HvError::NotFound)?;
        let position = page
            .patches
            .iter()
            .position(|patch| patch.id == id)
            .ok_or(HvError::NotFound)?;

        let patch = page.patches.remove(position);
        page.restore_range(patch.range());

        let mut retired = Retired {
            records: 1,
            ..Retired::default()
        };

        if page.patches.is_empty() {
            self.tree.set_leaf(page.base, page.original)?;
            if let Some(page) = hooks.shift_remove(&id.base()) {
                tracing::debug!(base = %page.base, hits = page.hits, "released hook page");
                retired.retire_page(page);
            }
        }

        tracing::debug!(%id, "removed patch");
        Ok(retired)
    }

    /// Removes one watchpoint and restores the page's original entry.
    pub fn remove_watchpoint(&self, id: HookId) -> Result<Retired, HvError> {
        if id.kind() != HookKind::Watch {
            return Err(HvError::NotFound);
        }

        let mut watchpoints = self.watchpoints.lock();
        match watchpoints.get(&id.base()) {
            Some(watchpoint) if watchpoint.id == id => {}
            _ => return Err(HvError::NotFound),
        }

        if let Some(watchpoint) = watchpoints.shift_remove(&id.base()) {
            self.tree.set_leaf(watchpoint.base, watchpoint.original)?;
        }

        tracing::debug!(%id, "removed watchpoint");
        Ok(Retired {
            records: 1,
            ..Retired::default()
        })
    }

    /// Removes every patch and watchpoint and merges every split back into
    /// its 2MiB leaf.
    ///
    /// Calling it again is a no-op.
    pub fn disable_all_hooks(&self) -> Retired {
        let mut hooks = self.hooks.lock();
        let mut watchpoints = self.watchpoints.lock();
        let mut retired = Retired::default();

        for (_, page) in hooks.drain(..) {
            retired.records += page.patches.len();
            retired.retire_page(page);
        }

        retired.records += watchpoints.len();
        watchpoints.clear();

        // Restoring the 2MiB leaves unlinks every hook and watchpoint entry.
        retired.tables = self.tree.merge_all();

        if !retired.is_empty() {
            tracing::debug!(
                records = retired.records,
                tables = retired.tables.len(),
                "disabled all hooks"
            );
        }

        retired
    }

    /// Removes every patch and watchpoint whose target is `pid`.
    ///
    /// Only bookkeeping and EPT entries are touched. The memory of the
    /// process is never read, so it is safe to call after the process's
    /// pages were reclaimed.
    pub fn cleanup_process(&self, pid: ProcessId) -> Retired {
        let mut hooks = self.hooks.lock();
        let mut watchpoints = self.watchpoints.lock();
        let mut retired = Retired::default();

        let mut emptied = Vec::new();
        for (base, page) in hooks.iter_mut() {
            let before = page.patches.len();
            let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut page.patches)
                .into_iter()
                .partition(|patch| patch.target == pid);
            page.patches = kept;

            if removed.is_empty() {
                continue;
            }

            retired.records += before - page.patches.len();
            for patch in &removed {
                page.restore_range(patch.range());
            }

            if page.patches.is_empty() {
                emptied.push(*base);
            }
        }

        for base in emptied {
            if let Some(page) = hooks.shift_remove(&base) {
                if let Err(err) = self.tree.set_leaf(base, page.original) {
                    tracing::warn!(%base, %err, "failed to restore hook page");
                }
                retired.retire_page(page);
            }
        }

        watchpoints.retain(|base, watchpoint| {
            if watchpoint.target != pid {
                return true;
            }

            if let Err(err) = self.tree.set_leaf(*base, watchpoint.original) {
                tracing::warn!(%base, %err, "failed to restore watched page");
            }

            retired.records += 1;
            false
        });

        if retired.records > 0 {
            tracing::debug!(%pid, records = retired.records, "cleaned up process");
        }

        retired
    }

    /// Handles an EPT violation at `gpa` raised on `core` by the instruction
    /// at `rip`.
    ///
    /// Hook pages switch to the execute image on an instruction fetch and
    /// back to the read/write image on a data access. Before switching to
    /// the execute image the shadow is resynchronized with the real page.
    /// Watched pages record `rip` and become fully accessible until the
    /// next [`Ept::handle_monitor_trap`] on the same core.
    ///
    /// The caller must invalidate the EPT and must not advance RIP unless
    /// the outcome is [`ViolationOutcome::Unexpected`].
    pub fn handle_violation(
        &self,
        memory: &impl HostMemory,
        core: usize,
        gpa: Pa,
        qualification: EptViolationQualification,
        rip: Va,
    ) -> ViolationOutcome {
        let base = gpa.page_base();

        let mut hooks = self.hooks.lock();
        if let Some(page) = hooks.get_mut(&base) {
            let next = if qualification.execute() && page.live != LiveImage::Execute {
                let mut current = [0u8; PAGE_SIZE as usize];
                match memory.read_physical(base, &mut current) {
                    Ok(()) => {
                        let coverage = page.coverage();
                        let changed = page.resync(0, &current, &coverage);
                        if changed > 0 {
                            tracing::trace!(%base, changed, "resynchronized shadow page");
                        }
                    }
                    Err(err) => tracing::warn!(%base, %err, "skipped shadow resync"),
                }

                LiveImage::Execute
            }
            else if (qualification.read() || qualification.write())
                && page.live == LiveImage::Execute
            {
                LiveImage::ReadWrite
            }
            else {
                return ViolationOutcome::Stale;
            };

            if self.tree.set_leaf(base, page.image(next)).is_err() {
                return ViolationOutcome::Unexpected;
            }

            page.live = next;
            page.hits += 1;

            tracing::trace!(%base, image = ?next, %rip, "toggled hook page");
            return ViolationOutcome::HookToggled(next);
        }
        drop(hooks);

        let mut watchpoints = self.watchpoints.lock();
        if let Some(watchpoint) = watchpoints.get_mut(&base) {
            if watchpoint.disarmed_by.is_some() {
                return ViolationOutcome::Stale;
            }

            self.ring.lock().push(rip);

            if self
                .tree
                .set_leaf(base, watchpoint.disarmed_entry())
                .is_err()
            {
                return ViolationOutcome::Unexpected;
            }

            watchpoint.disarmed_by = Some(core);

            tracing::trace!(core, %base, %rip, access = %qualification.access(), "watchpoint hit");
            return ViolationOutcome::WatchpointHit;
        }

        tracing::error!(%gpa, ?qualification, %rip, "EPT violation on unmanaged page");
        ViolationOutcome::Unexpected
    }

    /// Re-arms the watchpoints disarmed by a violation on `core`.
    ///
    /// Watchpoints disarmed by other cores stay open until those cores
    /// step past their own access. Returns the number of watchpoints
    /// re-armed.
    pub fn handle_monitor_trap(&self, core: usize) -> usize {
        let mut watchpoints = self.watchpoints.lock();
        let mut rearmed = 0;

        for watchpoint in watchpoints
            .values_mut()
            .filter(|watchpoint| watchpoint.disarmed_by == Some(core))
        {
            if self
                .tree
                .set_leaf(watchpoint.base, watchpoint.armed_entry())
                .is_ok()
            {
                watchpoint.disarmed_by = None;
                rearmed += 1;
            }
        }

        rearmed
    }

    /// Describes an EPT misconfiguration at `gpa`.
    ///
    /// A misconfiguration means a malformed entry was written, so the
    /// bookkeeping can no longer be trusted and nothing is repaired.
    pub fn handle_misconfiguration(&self, gpa: Pa) -> FatalCondition {
        tracing::error!(%gpa, translation = ?self.translate(gpa), "EPT misconfiguration");
        FatalCondition::EptMisconfiguration { address: gpa }
    }

    /// Returns the recorded instruction pointers, oldest first.
    pub fn access_records(&self) -> Vec<Va> {
        self.ring.lock().to_vec()
    }

    /// Empties the access ring.
    pub fn clear_access_records(&self) {
        self.ring.lock().clear();
    }

    /// Returns the current counters.
    pub fn statistics(&self) -> EptStatistics {
        let hooks = self.hooks.lock();
        let watchpoints = self.watchpoints.lock();

        EptStatistics {
            hook_pages: hooks.len(),
            patches: hooks.values().map(|page| page.patches.len()).sum(),
            watchpoints: watchpoints.len(),
            splits: self.tree.split_count(),
            hits: hooks.values().map(|page| page.hits).sum(),
        }
    }

    /// Returns the identifiers of every patch and watchpoint, with the
    /// processes that installed and are targeted by them.
    pub fn records(&self) -> Vec<(HookId, ProcessId, ProcessId)> {
        let hooks = self.hooks.lock();
        let watchpoints = self.watchpoints.lock();

        hooks
            .values()
            .flat_map(|page| page.patches.iter())
            .map(|patch| (patch.id, patch.source, patch.target))
            .chain(
                watchpoints
                    .values()
                    .map(|watchpoint| (watchpoint.id, watchpoint.source, watchpoint.target)),
            )
            .collect()
    }

    /// Returns the leaf table of the split covering `pa`, if any.
    pub fn split_table(&self, pa: Pa) -> Option<Pa> {
        self.tree.split_table(pa)
    }
}

impl std::fmt::Debug for Ept {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Ept")
            .field("pointer", &self.pointer())
            .field("statistics", &self.statistics())
            .finish()
    }
}

#[cfg(test)]
#[path = "ept_tests.rs"]
mod tests;
