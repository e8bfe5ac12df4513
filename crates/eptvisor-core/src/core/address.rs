use super::macros::impl_ops;

impl_ops!(Gfn, u64, "Physical Frame Number");
impl_ops!(Pa, u64, "Physical Address");
impl_ops!(Va, u64, "Virtual Address");

/// Size of the smallest translation granule.
pub const PAGE_SIZE: u64 = 0x1000;

/// Number of bits covered by the page offset.
pub const PAGE_SHIFT: u64 = 12;

/// Mask selecting the page-aligned part of an address.
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

impl Pa {
    /// Returns the address of the 4KiB page containing this address.
    pub fn page_base(self) -> Pa {
        Pa(self.0 & PAGE_MASK)
    }

    /// Returns the offset of this address within its 4KiB page.
    pub fn page_offset(self) -> u64 {
        self.0 & !PAGE_MASK
    }

    /// Returns the frame number of this address.
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    /// Checks if the address is aligned to a 4KiB page.
    pub fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl Gfn {
    /// Returns the physical address of the first byte of the frame.
    pub fn pa(self) -> Pa {
        Pa(self.0 << PAGE_SHIFT)
    }
}

impl Va {
    /// Checks if the virtual address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns the address of the 4KiB page containing this address.
    pub fn page_base(self) -> Va {
        Va(self.0 & PAGE_MASK)
    }

    /// Returns the offset of this address within its 4KiB page.
    pub fn page_offset(self) -> u64 {
        self.0 & !PAGE_MASK
    }
}
