use eptvisor_core::{PAGE_MASK, Pa};

use crate::msr;

/// Memory type used by the MTRRs and by EPT leaf entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryType {
    /// Uncacheable (UC).
    Uncacheable = 0,

    /// Write combining (WC).
    WriteCombining = 1,

    /// Write-through (WT).
    WriteThrough = 4,

    /// Write-protected (WP).
    WriteProtected = 5,

    /// Write-back (WB).
    WriteBack = 6,
}

impl MemoryType {
    /// Decodes a 3-bit memory type encoding.
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }
}

/// One enabled variable-range MTRR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrRange {
    /// First byte covered by the range.
    pub start: Pa,

    /// Last byte covered by the range (inclusive).
    pub end: Pa,

    /// Memory type the range assigns.
    pub memory_type: MemoryType,
}

impl MtrrRange {
    const VALID: u64 = 1 << 11;

    /// Decodes an `IA32_MTRR_PHYSBASEn` / `IA32_MTRR_PHYSMASKn` pair.
    ///
    /// Returns `None` if the pair is not enabled or holds a reserved memory
    /// type.
    pub fn decode(phys_base: u64, phys_mask: u64) -> Option<Self> {
        if phys_mask & Self::VALID == 0 {
            return None;
        }

        let memory_type = MemoryType::from_bits((phys_base & 0xff) as u8)?;
        let start = phys_base & PAGE_MASK;
        let mask = phys_mask & PAGE_MASK;
        if mask == 0 {
            return None;
        }

        let length = 1u64 << mask.trailing_zeros();
        Some(Self {
            start: Pa::new(start),
            end: Pa::new(start + length - 1),
            memory_type,
        })
    }

    /// Checks if the range intersects `[start, start + length)`.
    pub fn overlaps(&self, start: Pa, length: u64) -> bool {
        let first = u64::from(start);
        let last = first + length - 1;
        u64::from(self.start) <= last && first <= u64::from(self.end)
    }
}

/// Snapshot of the variable-range MTRRs of a processor.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MtrrMap {
    ranges: Vec<MtrrRange>,
}

impl MtrrMap {
    /// Reads the variable-range MTRRs through `read_msr`.
    ///
    /// The number of pairs is taken from `IA32_MTRRCAP.VCNT`.
    pub fn read(mut read_msr: impl FnMut(u32) -> u64) -> Self {
        let count = read_msr(msr::IA32_MTRRCAP) & 0xff;

        let ranges = (0..count as u32)
            .filter_map(|index| {
                let phys_base = read_msr(msr::IA32_MTRR_PHYSBASE0 + 2 * index);
                let phys_mask = read_msr(msr::IA32_MTRR_PHYSMASK0 + 2 * index);
                MtrrRange::decode(phys_base, phys_mask)
            })
            .collect();

        Self { ranges }
    }

    /// Creates a map from already decoded ranges.
    pub fn from_ranges(ranges: Vec<MtrrRange>) -> Self {
        Self { ranges }
    }

    /// Returns the decoded ranges in register order.
    pub fn ranges(&self) -> &[MtrrRange] {
        &self.ranges
    }

    /// Returns the memory type for `[start, start + length)`.
    ///
    /// The last overlapping range wins. Memory not covered by any range is
    /// write-back.
    pub fn memory_type(&self, start: Pa, length: u64) -> MemoryType {
        self.ranges
            .iter()
            .rev()
            .find(|range| range.overlaps(start, length))
            .map(|range| range.memory_type)
            .unwrap_or(MemoryType::WriteBack)
    }
}
