use std::ops::{Deref, DerefMut};

use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::{HvError, PAGE_SIZE};

/// A page-aligned 4KiB buffer.
///
/// Pages handed to the processor (VMXON regions, VMCS, MSR bitmaps, shadow
/// pages) must be page-aligned and must never move once their physical
/// address has been published, so they are always heap allocated.
#[repr(C, align(4096))]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct Page(pub [u8; PAGE_SIZE as usize]);

impl Page {
    /// Allocates a zero-filled page.
    pub fn new_zeroed() -> Result<Box<Self>, HvError> {
        allocate_zeroed()
    }

    /// Allocates a page holding a copy of `content`.
    pub fn from_content(content: &[u8; PAGE_SIZE as usize]) -> Result<Box<Self>, HvError> {
        let mut page = Self::new_zeroed()?;
        page.0.copy_from_slice(content);
        Ok(page)
    }
}

impl Deref for Page {
    type Target = [u8; PAGE_SIZE as usize];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Allocates a zero-initialized `T` on the heap, reporting allocation failure
/// instead of aborting.
pub fn allocate_zeroed<T>() -> Result<Box<T>, HvError>
where
    T: FromZeros,
{
    Ok(T::new_box_zeroed()?)
}
