use eptvisor_arch_amd64::EptEntry;
use eptvisor_core::{MemoryAccess, PAGE_SIZE, Page, Pa, ProcessId};
use smallvec::SmallVec;

/// Kind of record a [`HookId`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HookKind {
    /// A byte patch visible only to instruction fetches.
    Patch,

    /// An execution watchpoint.
    Watch,
}

/// Identifier of an installed hook patch or watchpoint.
///
/// Identifiers are never reused: the sequence number grows monotonically
/// for the lifetime of the EPT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HookId {
    kind: HookKind,
    sequence: u64,
    base: Pa,
}

impl HookId {
    pub(crate) fn new(kind: HookKind, sequence: u64, base: Pa) -> Self {
        Self {
            kind,
            sequence,
            base,
        }
    }

    /// Returns the kind of record.
    pub fn kind(&self) -> HookKind {
        self.kind
    }

    /// Returns the sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the guest-physical base of the page the record lives on.
    pub fn base(&self) -> Pa {
        self.base
    }
}

impl std::fmt::Display for HookId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self.kind {
            HookKind::Patch => "patch",
            HookKind::Watch => "watch",
        };

        write!(f, "{kind}#{}@{}", self.sequence, self.base)
    }
}

/// Bytes substituted into the shadow page. Up to 32 bytes are stored inline.
pub(crate) type Payload = SmallVec<[u8; 32]>;

/// One patch on a hooked page.
pub(crate) struct HookPatch {
    pub(crate) id: HookId,
    pub(crate) offset: usize,
    pub(crate) payload: Payload,
    pub(crate) source: ProcessId,
    pub(crate) target: ProcessId,
}

impl HookPatch {
    pub(crate) fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.payload.len()
    }

    pub(crate) fn intersects(&self, range: &std::ops::Range<usize>) -> bool {
        self.offset < range.end && range.start < self.offset + self.payload.len()
    }
}

/// Which entry image is currently installed in the live leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveImage {
    /// The read/write image pointing at the original page.
    ReadWrite,

    /// The execute-only image pointing at the shadow page.
    Execute,
}

/// A page carrying one or more patches.
///
/// The page owns two entry images. Exactly one of them is live at a time
/// and the other is kept ready, so a toggle is a single entry store.
pub(crate) struct HookPage {
    pub(crate) base: Pa,
    pub(crate) original: EptEntry,
    pub(crate) execute: EptEntry,
    pub(crate) read_write: EptEntry,
    pub(crate) live: LiveImage,
    pub(crate) shadow: Box<Page>,
    pub(crate) reference: Box<Page>,
    pub(crate) patches: Vec<HookPatch>,
    pub(crate) hits: u64,
}

impl HookPage {
    /// Builds the two images for a page whose leaf is `original` and whose
    /// shadow copy lives at `shadow_pa`.
    pub(crate) fn images(original: EptEntry, shadow_pa: Pa) -> (EptEntry, EptEntry) {
        let execute = original
            .with_pfn(shadow_pa.gfn())
            .with_access(MemoryAccess::X);
        let read_write = original.with_access(MemoryAccess::RW);
        (execute, read_write)
    }

    /// Returns the entry matching `image`.
    pub(crate) fn image(&self, image: LiveImage) -> EptEntry {
        match image {
            LiveImage::ReadWrite => self.read_write,
            LiveImage::Execute => self.execute,
        }
    }

    /// Writes `patch` into the shadow page.
    pub(crate) fn apply(&mut self, patch: &HookPatch) {
        self.shadow[patch.range()].copy_from_slice(&patch.payload);
    }

    /// Restores `range` of the shadow from the reference copy and re-applies
    /// every remaining patch that overlaps it, in installation order.
    pub(crate) fn restore_range(&mut self, range: std::ops::Range<usize>) {
        self.shadow[range.clone()].copy_from_slice(&self.reference[range.clone()]);

        for index in 0..self.patches.len() {
            if self.patches[index].intersects(&range) {
                let patch_range = self.patches[index].range();
                let (shadow, patches) = (&mut self.shadow, &self.patches);
                shadow[patch_range].copy_from_slice(&patches[index].payload);
            }
        }
    }

    /// Returns a bitmap of the bytes covered by any patch.
    pub(crate) fn coverage(&self) -> PatchCoverage {
        let mut coverage = PatchCoverage::default();
        for patch in &self.patches {
            coverage.insert(patch.range());
        }
        coverage
    }

    /// Propagates bytes of `current` that differ from the reference copy
    /// into the reference and the shadow, skipping patched bytes.
    ///
    /// Returns the number of bytes propagated.
    pub(crate) fn resync(
        &mut self,
        offset: usize,
        current: &[u8],
        coverage: &PatchCoverage,
    ) -> usize {
        let mut changed = 0;

        for (index, &byte) in current.iter().enumerate() {
            let position = offset + index;
            if self.reference[position] == byte || coverage.contains(position) {
                continue;
            }

            self.reference[position] = byte;
            self.shadow[position] = byte;
            changed += 1;
        }

        changed
    }
}

/// One bit per byte of a page.
pub(crate) struct PatchCoverage([u64; PAGE_SIZE as usize / 64]);

impl Default for PatchCoverage {
    fn default() -> Self {
        Self([0; PAGE_SIZE as usize / 64])
    }
}

impl PatchCoverage {
    pub(crate) fn insert(&mut self, range: std::ops::Range<usize>) {
        for position in range {
            self.0[position / 64] |= 1 << (position % 64);
        }
    }

    pub(crate) fn contains(&self, position: usize) -> bool {
        self.0[position / 64] & (1 << (position % 64)) != 0
    }
}
