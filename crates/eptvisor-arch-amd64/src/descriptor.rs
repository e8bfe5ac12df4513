/// Global Descriptor Table Register (GDTR).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Gdtr {
    /// Linear address of the GDT.
    pub base: u64,

    /// Size of the GDT in bytes, minus one.
    pub limit: u16,
}

/// Interrupt Descriptor Table Register (IDTR).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Idtr {
    /// Linear address of the IDT.
    pub base: u64,

    /// Size of the IDT in bytes, minus one.
    pub limit: u16,
}
