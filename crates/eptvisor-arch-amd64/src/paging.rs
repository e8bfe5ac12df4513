use std::sync::atomic::{AtomicU64, Ordering};

use eptvisor_core::{Gfn, MemoryAccess, PAGE_SHIFT, Pa};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::MemoryType;

/// Number of entries in every EPT paging structure.
pub const EPT_ENTRY_COUNT: usize = 512;

/// Size of a page mapped by a PML2 leaf.
pub const LARGE_PAGE_SIZE: u64 = 0x20_0000;

/// Bytes of guest-physical address space covered by one PML3 entry.
pub const GIB: u64 = 0x4000_0000;

/// The levels in the EPT hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum EptLevel {
    /// Page table, maps 4KiB pages.
    Pml1,

    /// Page directory, maps 2MiB pages or points to a [`Pml1`] table.
    ///
    /// [`Pml1`]: Self::Pml1
    Pml2,

    /// Page directory pointer table.
    Pml3,

    /// Top-level table.
    Pml4,
}

impl EptLevel {
    /// Returns the next lower level in the hierarchy.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Pml1 => None,
            Self::Pml2 => Some(Self::Pml1),
            Self::Pml3 => Some(Self::Pml2),
            Self::Pml4 => Some(Self::Pml3),
        }
    }

    /// Returns the position of the lowest address bit that selects an entry
    /// at this level.
    pub fn shift(self) -> u64 {
        PAGE_SHIFT + 9 * self as u64
    }

    /// Returns the number of bytes mapped by one entry at this level.
    pub fn entry_span(self) -> u64 {
        1 << self.shift()
    }

    /// Extracts the 9-bit table index of `pa` for this level.
    pub fn index_of(self, pa: Pa) -> usize {
        ((u64::from(pa) >> self.shift()) & 0x1ff) as usize
    }
}

/// Returns bits 12 to 20 of `pa`.
pub fn pml1_index(pa: Pa) -> usize {
    EptLevel::Pml1.index_of(pa)
}

/// Returns bits 21 to 29 of `pa`.
pub fn pml2_index(pa: Pa) -> usize {
    EptLevel::Pml2.index_of(pa)
}

/// Returns bits 30 to 38 of `pa`.
pub fn pml3_index(pa: Pa) -> usize {
    EptLevel::Pml3.index_of(pa)
}

/// Returns bits 39 to 47 of `pa`.
pub fn pml4_index(pa: Pa) -> usize {
    EptLevel::Pml4.index_of(pa)
}

/// An entry in any of the EPT paging structures.
///
/// Bits 0 to 2 hold the access rights in the same layout as
/// [`MemoryAccess`]. Leaf entries additionally carry the memory type
/// (bits 3 to 5), the ignore-PAT flag (bit 6) and the suppress-#VE flag
/// (bit 63). Bit 7 marks a PML2 entry as a 2MiB leaf.
#[repr(transparent)]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EptEntry(pub u64);

impl EptEntry {
    const ACCESS_MASK: u64 = 0b111;
    const MEMORY_TYPE_SHIFT: u64 = 3;
    const MEMORY_TYPE_MASK: u64 = 0b111 << Self::MEMORY_TYPE_SHIFT;
    const IGNORE_PAT: u64 = 1 << 6;
    const LARGE: u64 = 1 << 7;
    const PFN_MASK: u64 = 0x000f_ffff_ffff_f000;
    const SUPPRESS_VE: u64 = 1 << 63;

    /// Creates a non-leaf entry referencing the table at `table`.
    ///
    /// Non-leaf entries grant full access so that the effective rights are
    /// decided by the leaf.
    pub fn table(table: Pa) -> Self {
        Self(u64::from(table) & Self::PFN_MASK | MemoryAccess::RWX.bits() as u64)
    }

    /// Creates a 2MiB leaf with full access.
    pub fn large_leaf(pa: Pa, memory_type: MemoryType) -> Self {
        Self(u64::from(pa) & Self::PFN_MASK | MemoryAccess::RWX.bits() as u64 | Self::LARGE)
            .with_memory_type(memory_type)
    }

    /// Creates a 4KiB leaf with full access.
    pub fn leaf(pa: Pa, memory_type: MemoryType) -> Self {
        Self(u64::from(pa) & Self::PFN_MASK | MemoryAccess::RWX.bits() as u64)
            .with_memory_type(memory_type)
    }

    /// Checks if any access right is granted.
    ///
    /// An entry without rights is not present.
    pub fn present(self) -> bool {
        self.0 & Self::ACCESS_MASK != 0
    }

    /// Returns the access rights.
    pub fn access(self) -> MemoryAccess {
        MemoryAccess::from_bits_truncate((self.0 & Self::ACCESS_MASK) as u8)
    }

    /// Returns a copy of the entry with the access rights replaced.
    pub fn with_access(self, access: MemoryAccess) -> Self {
        Self(self.0 & !Self::ACCESS_MASK | access.bits() as u64)
    }

    /// Returns the memory type of a leaf.
    ///
    /// Encodings the processor reserves are reported as
    /// [`MemoryType::Uncacheable`].
    pub fn memory_type(self) -> MemoryType {
        let bits = (self.0 & Self::MEMORY_TYPE_MASK) >> Self::MEMORY_TYPE_SHIFT;
        MemoryType::from_bits(bits as u8).unwrap_or(MemoryType::Uncacheable)
    }

    /// Returns a copy of the entry with the memory type replaced.
    pub fn with_memory_type(self, memory_type: MemoryType) -> Self {
        Self(self.0 & !Self::MEMORY_TYPE_MASK | (memory_type as u64) << Self::MEMORY_TYPE_SHIFT)
    }

    /// Checks if the guest PAT is ignored for this leaf.
    pub fn ignore_pat(self) -> bool {
        self.0 & Self::IGNORE_PAT != 0
    }

    /// Returns a copy of the entry with the ignore-PAT flag replaced.
    pub fn with_ignore_pat(self, value: bool) -> Self {
        self.with_flag(Self::IGNORE_PAT, value)
    }

    /// Checks if the entry maps a 2MiB page.
    pub fn large(self) -> bool {
        self.0 & Self::LARGE != 0
    }

    /// Returns a copy of the entry with the large-page flag replaced.
    pub fn with_large(self, value: bool) -> Self {
        self.with_flag(Self::LARGE, value)
    }

    /// Checks if EPT violations on this leaf are reported as VM exits rather
    /// than virtualization exceptions.
    pub fn suppress_ve(self) -> bool {
        self.0 & Self::SUPPRESS_VE != 0
    }

    /// Returns a copy of the entry with the suppress-#VE flag replaced.
    pub fn with_suppress_ve(self, value: bool) -> Self {
        self.with_flag(Self::SUPPRESS_VE, value)
    }

    /// Returns the frame referenced by the entry.
    pub fn pfn(self) -> Gfn {
        Gfn::new((self.0 & Self::PFN_MASK) >> PAGE_SHIFT)
    }

    /// Returns a copy of the entry referencing `pfn`.
    pub fn with_pfn(self, pfn: Gfn) -> Self {
        Self(self.0 & !Self::PFN_MASK | (u64::from(pfn) << PAGE_SHIFT) & Self::PFN_MASK)
    }

    /// Returns the physical address referenced by the entry.
    pub fn address(self) -> Pa {
        self.pfn().pa()
    }

    fn with_flag(self, flag: u64, value: bool) -> Self {
        if value {
            Self(self.0 | flag)
        }
        else {
            Self(self.0 & !flag)
        }
    }
}

impl std::fmt::Debug for EptEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EptEntry")
            .field("access", &format_args!("{}", self.access()))
            .field("memory_type", &self.memory_type())
            .field("ignore_pat", &self.ignore_pat())
            .field("large", &self.large())
            .field("suppress_ve", &self.suppress_ve())
            .field("pfn", &self.pfn())
            .finish()
    }
}

impl From<u64> for EptEntry {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<EptEntry> for u64 {
    fn from(value: EptEntry) -> Self {
        value.0
    }
}

/// One EPT paging structure.
///
/// Entries are atomics because the processor walks the table while other
/// cores are running the guest; every update replaces a whole entry.
#[repr(C, align(4096))]
#[derive(FromZeros)]
pub struct EptTable {
    entries: [AtomicU64; EPT_ENTRY_COUNT],
}

impl EptTable {
    /// Returns the entry at `index`.
    pub fn load(&self, index: usize) -> EptEntry {
        EptEntry(self.entries[index].load(Ordering::Acquire))
    }

    /// Replaces the entry at `index`.
    pub fn store(&self, index: usize, entry: EptEntry) {
        self.entries[index].store(entry.0, Ordering::Release);
    }

    /// Replaces the entry at `index` and returns the previous one.
    pub fn swap(&self, index: usize, entry: EptEntry) -> EptEntry {
        EptEntry(self.entries[index].swap(entry.0, Ordering::AcqRel))
    }

    /// Returns an iterator over all entries.
    pub fn iter(&self) -> impl Iterator<Item = EptEntry> + '_ {
        self.entries
            .iter()
            .map(|entry| EptEntry(entry.load(Ordering::Acquire)))
    }
}

impl std::fmt::Debug for EptTable {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let present = self.iter().filter(|entry| entry.present()).count();
        f.debug_struct("EptTable")
            .field("present", &present)
            .finish_non_exhaustive()
    }
}

/// The extended-page-table pointer (EPTP) VMCS field.
#[derive(Default, Clone, Copy, PartialEq, Eq)]
pub struct EptPointer(pub u64);

impl EptPointer {
    const WALK_LENGTH_SHIFT: u64 = 3;

    /// Creates a write-back, 4-level pointer to the PML4 table at `pml4`.
    pub fn new(pml4: Pa) -> Self {
        Self(
            MemoryType::WriteBack as u64
                | 3 << Self::WALK_LENGTH_SHIFT
                | u64::from(pml4) & EptEntry::PFN_MASK,
        )
    }

    /// Returns the memory type used to access the paging structures.
    pub fn memory_type(self) -> MemoryType {
        MemoryType::from_bits((self.0 & 0b111) as u8).unwrap_or(MemoryType::Uncacheable)
    }

    /// Returns the page-walk length (number of levels).
    pub fn walk_length(self) -> u8 {
        ((self.0 >> Self::WALK_LENGTH_SHIFT) & 0b111) as u8 + 1
    }

    /// Returns the physical address of the PML4 table.
    pub fn pml4(self) -> Pa {
        Pa::new(self.0 & EptEntry::PFN_MASK)
    }
}

impl std::fmt::Debug for EptPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EptPointer")
            .field("memory_type", &self.memory_type())
            .field("walk_length", &self.walk_length())
            .field("pml4", &self.pml4())
            .finish()
    }
}

impl From<EptPointer> for u64 {
    fn from(value: EptPointer) -> Self {
        value.0
    }
}

/// INVEPT invalidation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum InveptType {
    /// Invalidates mappings associated with one EPTP.
    SingleContext = 1,

    /// Invalidates mappings associated with all EPTPs.
    AllContexts = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_extraction() {
        let pa = Pa::new(0x0000_7f12_3456_7000);
        assert_eq!(pml1_index(pa), (0x0000_7f12_3456_7000 >> 12) & 0x1ff);
        assert_eq!(pml2_index(pa), (0x0000_7f12_3456_7000 >> 21) & 0x1ff);
        assert_eq!(pml3_index(pa), (0x0000_7f12_3456_7000 >> 30) & 0x1ff);
        assert_eq!(pml4_index(pa), (0x0000_7f12_3456_7000 >> 39) & 0x1ff);

        assert_eq!(pml1_index(Pa::new(0x123000)), 0x123);
        assert_eq!(pml2_index(Pa::new(0x4020_0000)), 1);
        assert_eq!(pml3_index(Pa::new(0x4020_0000)), 1);
        assert_eq!(pml4_index(Pa::new(0x4020_0000)), 0);
    }

    #[test]
    fn index_extraction_all_bits() {
        for shift in 0..48 {
            let value = 1u64 << shift;
            let pa = Pa::new(value);
            assert_eq!(pml1_index(pa) as u64, (value >> 12) & 0x1ff);
            assert_eq!(pml2_index(pa) as u64, (value >> 21) & 0x1ff);
            assert_eq!(pml3_index(pa) as u64, (value >> 30) & 0x1ff);
            assert_eq!(pml4_index(pa) as u64, (value >> 39) & 0x1ff);
        }
    }

    #[test]
    fn leaf_fields() {
        let entry = EptEntry::large_leaf(Pa::new(0x20_0000), MemoryType::WriteBack);
        assert_eq!(entry.0, 0x20_0000 | 0b111 | 6 << 3 | 1 << 7);
        assert!(entry.large());
        assert_eq!(entry.access(), MemoryAccess::RWX);
        assert_eq!(entry.address(), Pa::new(0x20_0000));

        let entry = entry
            .with_access(MemoryAccess::X)
            .with_suppress_ve(true)
            .with_ignore_pat(true)
            .with_large(false);
        assert_eq!(entry.access(), MemoryAccess::X);
        assert!(entry.suppress_ve());
        assert!(entry.ignore_pat());
        assert!(!entry.large());
        assert_eq!(entry.memory_type(), MemoryType::WriteBack);

        let entry = entry.with_pfn(Gfn::new(0x1234));
        assert_eq!(entry.address(), Pa::new(0x123_4000));
        assert_eq!(entry.access(), MemoryAccess::X);
    }

    #[test]
    fn ept_pointer_layout() {
        let eptp = EptPointer::new(Pa::new(0x7654_3000));
        assert_eq!(eptp.0, 0x7654_3000 | 6 | 3 << 3);
        assert_eq!(eptp.walk_length(), 4);
        assert_eq!(eptp.memory_type(), MemoryType::WriteBack);
        assert_eq!(eptp.pml4(), Pa::new(0x7654_3000));
    }
}
