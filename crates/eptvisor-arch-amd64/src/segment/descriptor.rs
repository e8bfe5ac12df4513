use super::{SegmentAccess, Selector};

/// A segment register in the form the VMCS guest-state area expects it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Linear base address.
    pub base: u64,

    /// Segment limit in bytes, already scaled by the granularity flag.
    pub limit: u32,

    /// The selector that was loaded.
    pub selector: Selector,

    /// VMX access rights.
    pub access: SegmentAccess,
}

impl SegmentDescriptor {
    /// Returns a descriptor for a selector that references nothing.
    pub fn unusable(selector: Selector) -> Self {
        Self {
            base: 0,
            limit: 0,
            selector,
            access: SegmentAccess::UNUSABLE,
        }
    }

    /// Decodes a GDT entry.
    ///
    /// `raw` holds 16 bytes starting at the descriptor. Only system
    /// descriptors (TSS, LDT) use the upper 8 bytes, which carry bits 32 to
    /// 63 of the base.
    pub fn decode(selector: Selector, raw: &[u8; 16]) -> Self {
        if selector.is_null() {
            return Self::unusable(selector);
        }

        let mut low = [0u8; 8];
        low.copy_from_slice(&raw[..8]);
        let low = u64::from_le_bytes(low);

        let mut high = [0u8; 4];
        high.copy_from_slice(&raw[8..12]);
        let high = u32::from_le_bytes(high) as u64;

        let access = SegmentAccess((low >> 40) as u32 & 0xf0ff);

        let mut limit = (low & 0xffff) as u32 | (low >> 32) as u32 & 0xf_0000;
        if access.granularity() {
            limit = limit << 12 | 0xfff;
        }

        let mut base = (low >> 16) & 0xff_ffff | ((low >> 56) & 0xff) << 24;
        if access.is_system() {
            base |= high << 32;
        }

        Self {
            base,
            limit,
            selector,
            access,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_code_segment() {
        // 64-bit kernel code segment: base 0, limit 0, L=1, P=1, DPL=0, type 0xb.
        let raw = 0x0020_9b00_0000_0000u64.to_le_bytes();
        let mut descriptor = [0u8; 16];
        descriptor[..8].copy_from_slice(&raw);

        let segment = SegmentDescriptor::decode(Selector(0x10), &descriptor);
        assert_eq!(segment.base, 0);
        assert_eq!(segment.limit, 0);
        assert_eq!(segment.access.0, 0x209b);
        assert!(segment.access.long_mode());
        assert!(!segment.access.unusable());
    }

    #[test]
    fn decode_tss() {
        // 64-bit TSS at 0xfffff800_12345000, limit 0x67.
        let low = 0x1200_8b34_5000_0067u64;
        let high = 0xffff_f800u64;
        let mut descriptor = [0u8; 16];
        descriptor[..8].copy_from_slice(&low.to_le_bytes());
        descriptor[8..].copy_from_slice(&high.to_le_bytes());

        let segment = SegmentDescriptor::decode(Selector(0x40), &descriptor);
        assert_eq!(segment.base, 0xffff_f800_1234_5000);
        assert_eq!(segment.limit, 0x67);
        assert_eq!(segment.access.typ(), 0xb);
        assert!(segment.access.is_system());
    }

    #[test]
    fn decode_page_granular_limit() {
        // 32-bit data segment, limit 0xfffff with G=1.
        let raw = 0x00cf_9300_0000_ffffu64.to_le_bytes();
        let mut descriptor = [0u8; 16];
        descriptor[..8].copy_from_slice(&raw);

        let segment = SegmentDescriptor::decode(Selector(0x2b), &descriptor);
        assert_eq!(segment.limit, 0xffff_ffff);
        assert_eq!(segment.access.0, 0xc093);
    }

    #[test]
    fn null_selector_is_unusable() {
        let segment = SegmentDescriptor::decode(Selector(3), &[0xff; 16]);
        assert!(segment.access.unusable());
        assert_eq!(segment.base, 0);
    }
}
