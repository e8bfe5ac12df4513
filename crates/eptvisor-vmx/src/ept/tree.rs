use eptvisor_arch_amd64::{
    EptEntry, EptLevel, EptPointer, EptTable, GIB, LARGE_PAGE_SIZE, MtrrMap, pml2_index,
    pml3_index, pml4_index,
};
use eptvisor_core::{HvError, MemoryAccess, PAGE_SIZE, Pa, Va, allocate_zeroed};
use indexmap::IndexMap;

use crate::platform::HostMemory;

/// GiB described by the single PML3 table under PML4 entry 0.
const IDENTITY_GIB: usize = 512;

/// A 4KiB leaf table that replaced a 2MiB leaf.
pub(crate) struct SplitTable {
    pub(crate) table: Box<EptTable>,
    pub(crate) table_pa: Pa,
    pub(crate) original: EptEntry,
}

/// Result of walking the EPT for one guest-physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Host-physical address the guest-physical address maps to.
    pub host: Pa,

    /// Rights granted by the leaf.
    pub access: MemoryAccess,

    /// Level of the leaf.
    pub level: EptLevel,

    /// The leaf entry.
    pub entry: EptEntry,
}

/// The paging structures of the identity map.
///
/// The PML4, PML3 and PML2 tables are created once and never change shape.
/// Only PML2 entries flip between 2MiB leaves and split tables, and leaf
/// entries change rights and frames.
pub(crate) struct EptTree {
    pml4: Box<EptTable>,
    pml4_pa: Pa,
    _pml3: Box<EptTable>,
    pml2: Vec<Box<EptTable>>,
    splits: spin::Mutex<IndexMap<Pa, SplitTable>>,
}

fn publish<T>(memory: &impl HostMemory, object: &T) -> Result<Pa, HvError> {
    let va = Va::new(object as *const T as u64);
    memory
        .host_physical_address(va)
        .ok_or(HvError::TranslationFailed(va))
}

impl EptTree {
    /// Builds the identity map over the first 512GiB of guest-physical
    /// memory.
    ///
    /// Device memory above RAM (the local APIC, PCI holes, 64-bit BARs) is
    /// mapped too, with the memory type the MTRRs assign to it.
    pub(crate) fn identity(memory: &impl HostMemory, mtrr: &MtrrMap) -> Result<Self, HvError> {
        let gib = IDENTITY_GIB;

        let pml4 = allocate_zeroed::<EptTable>()?;
        let pml3 = allocate_zeroed::<EptTable>()?;
        let pml4_pa = publish(memory, &*pml4)?;
        let pml3_pa = publish(memory, &*pml3)?;

        pml4.store(0, EptEntry::table(pml3_pa));

        let mut pml2 = Vec::with_capacity(gib);
        for index in 0..gib {
            let table = allocate_zeroed::<EptTable>()?;
            let table_pa = publish(memory, &*table)?;

            for entry in 0..512 {
                let pa = Pa::new(index as u64 * GIB + entry as u64 * LARGE_PAGE_SIZE);
                let memory_type = mtrr.memory_type(pa, LARGE_PAGE_SIZE);
                table.store(entry, EptEntry::large_leaf(pa, memory_type));
            }

            pml3.store(index, EptEntry::table(table_pa));
            pml2.push(table);
        }

        tracing::debug!(%pml4_pa, gib, "built identity map");

        Ok(Self {
            pml4,
            pml4_pa,
            _pml3: pml3,
            pml2,
            splits: spin::Mutex::new(IndexMap::new()),
        })
    }

    /// Returns the EPT pointer of this tree.
    pub(crate) fn pointer(&self) -> EptPointer {
        EptPointer::new(self.pml4_pa)
    }

    /// Returns the number of bytes of guest-physical memory that are mapped.
    pub(crate) fn covered(&self) -> u64 {
        self.pml2.len() as u64 * GIB
    }

    /// Returns the PML2 table and index covering `pa`.
    fn pml2_slot(&self, pa: Pa) -> Result<(&EptTable, usize), HvError> {
        if pml4_index(pa) != 0 {
            return Err(HvError::AddressOutOfRange(pa));
        }

        let table = self
            .pml2
            .get(pml3_index(pa))
            .ok_or(HvError::AddressOutOfRange(pa))?;

        Ok((table, pml2_index(pa)))
    }

    /// Returns the PML2 entry covering `pa`.
    pub(crate) fn pml2_entry(&self, pa: Pa) -> Result<EptEntry, HvError> {
        let (table, index) = self.pml2_slot(pa)?;
        Ok(table.load(index))
    }

    /// Replaces the 2MiB leaf covering `pa` with a table of 512 4KiB leaves.
    ///
    /// Returns the physical address of the leaf table. Splitting a region
    /// that is already split returns the existing table.
    pub(crate) fn split_large_page(
        &self,
        memory: &impl HostMemory,
        pa: Pa,
    ) -> Result<Pa, HvError> {
        let region = Pa::new(u64::from(pa) & !(LARGE_PAGE_SIZE - 1));
        let (pml2, index) = self.pml2_slot(region)?;

        let mut splits = self.splits.lock();
        if let Some(split) = splits.get(&region) {
            return Ok(split.table_pa);
        }

        let original = pml2.load(index);
        if !original.large() {
            return Err(HvError::Other("PML2 entry is neither a leaf nor a known split"));
        }

        let table = allocate_zeroed::<EptTable>()?;
        let table_pa = publish(memory, &*table)?;

        let base = original.address();
        for entry in 0..512 {
            let leaf = EptEntry::leaf(base + entry as u64 * PAGE_SIZE, original.memory_type())
                .with_access(original.access())
                .with_ignore_pat(original.ignore_pat())
                .with_suppress_ve(original.suppress_ve());
            table.store(entry, leaf);
        }

        pml2.store(index, EptEntry::table(table_pa));
        splits.insert(
            region,
            SplitTable {
                table,
                table_pa,
                original,
            },
        );

        tracing::debug!(%region, %table_pa, "split large page");
        Ok(table_pa)
    }

    /// Returns the 4KiB leaf for the page containing `pa`.
    ///
    /// Fails if the covering region has not been split.
    pub(crate) fn leaf(&self, pa: Pa) -> Result<EptEntry, HvError> {
        let region = Pa::new(u64::from(pa) & !(LARGE_PAGE_SIZE - 1));
        let splits = self.splits.lock();
        let split = splits.get(&region).ok_or(HvError::NotFound)?;
        Ok(split.table.load(EptLevel::Pml1.index_of(pa)))
    }

    /// Replaces the 4KiB leaf for the page containing `pa`.
    pub(crate) fn set_leaf(&self, pa: Pa, entry: EptEntry) -> Result<EptEntry, HvError> {
        let region = Pa::new(u64::from(pa) & !(LARGE_PAGE_SIZE - 1));
        let splits = self.splits.lock();
        let split = splits.get(&region).ok_or(HvError::NotFound)?;
        Ok(split.table.swap(EptLevel::Pml1.index_of(pa), entry))
    }

    /// Walks the tree for `pa`.
    pub(crate) fn translate(&self, pa: Pa) -> Option<Translation> {
        let pml3 = self.pml4.load(pml4_index(pa));
        if !pml3.present() {
            return None;
        }

        let (pml2, index) = self.pml2_slot(pa).ok()?;
        let entry = pml2.load(index);
        if entry.large() {
            let offset = u64::from(pa) & (LARGE_PAGE_SIZE - 1);
            return Some(Translation {
                host: entry.address() + offset,
                access: entry.access(),
                level: EptLevel::Pml2,
                entry,
            });
        }

        let region = Pa::new(u64::from(pa) & !(LARGE_PAGE_SIZE - 1));
        let splits = self.splits.lock();
        let split = splits.get(&region)?;
        let entry = split.table.load(EptLevel::Pml1.index_of(pa));
        Some(Translation {
            host: entry.address() + pa.page_offset(),
            access: entry.access(),
            level: EptLevel::Pml1,
            entry,
        })
    }

    /// Returns the number of split regions.
    pub(crate) fn split_count(&self) -> usize {
        self.splits.lock().len()
    }

    /// Returns the leaf table of the split covering `pa`, if any.
    pub(crate) fn split_table(&self, pa: Pa) -> Option<Pa> {
        let region = Pa::new(u64::from(pa) & !(LARGE_PAGE_SIZE - 1));
        self.splits.lock().get(&region).map(|split| split.table_pa)
    }

    /// Puts every split region back to its original 2MiB leaf.
    ///
    /// The leaf tables are returned rather than freed: other cores may still
    /// hold cached translations through them until they are invalidated.
    pub(crate) fn merge_all(&self) -> Vec<Box<EptTable>> {
        let mut splits = self.splits.lock();
        let mut retired = Vec::with_capacity(splits.len());

        for (region, split) in splits.drain(..) {
            if let Ok((pml2, index)) = self.pml2_slot(region) {
                pml2.store(index, split.original);
                tracing::debug!(%region, "reconstituted large page");
            }

            retired.push(split.table);
        }

        retired
    }
}
