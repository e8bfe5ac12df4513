use eptvisor_core::{HvError, PAGE_SIZE, Page, Pa, ProcessId, Va};

use crate::platform::{AddressSpace, HostMemory};

/// Translation and content of one page, captured in the address space of
/// the process that requested a hook.
///
/// Hints let the hook installer resolve the destination without switching
/// to the target's address space.
pub struct TranslationHint {
    /// Physical address of the page.
    pub physical_base: Pa,

    /// Virtual address of the page in the requesting process.
    pub virtual_base: Va,

    /// Snapshot of the page content.
    pub content: Box<Page>,
}

impl std::fmt::Debug for TranslationHint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TranslationHint")
            .field("physical_base", &self.physical_base)
            .field("virtual_base", &self.virtual_base)
            .finish_non_exhaustive()
    }
}

/// Returns the first page base and the number of pages touched by
/// `[address, address + length)`.
///
/// Fails if the range wraps around the end of the address space.
pub(crate) fn page_span(address: Va, length: usize) -> Result<(Va, u64), HvError> {
    if length == 0 {
        return Ok((address.page_base(), 0));
    }

    let last = u64::from(address)
        .checked_add(length as u64 - 1)
        .ok_or(HvError::RangeOverflow { address, length })?;

    let first = address.page_base();
    let count = (Va::new(last).page_base() - first) / PAGE_SIZE + 1;
    Ok((first, count))
}

/// Captures a hint for every page touched by `[destination, destination + length)`
/// in the address space of `pid`.
pub fn generate_translation_hints(
    platform: &(impl HostMemory + AddressSpace),
    pid: ProcessId,
    destination: Va,
    length: usize,
) -> Result<Vec<TranslationHint>, HvError> {
    let (first, count) = page_span(destination, length)?;

    let mut hints = Vec::new();
    for index in 0..count {
        let virtual_base = first + index * PAGE_SIZE;
        let physical_base = platform
            .translate(pid, virtual_base)
            .ok_or(HvError::TranslationFailed(virtual_base))?
            .page_base();

        let mut content = Page::new_zeroed()?;
        platform.read_physical(physical_base, &mut content.0)?;

        hints.push(TranslationHint {
            physical_base,
            virtual_base,
            content,
        });
    }

    Ok(hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    #[test]
    fn span_counts_touched_pages() -> Result<(), HvError> {
        assert_eq!(page_span(Va(0x1ff0), 0x20)?, (Va(0x1000), 2));
        assert_eq!(page_span(Va(0x3000), 0x1000)?, (Va(0x3000), 1));
        assert_eq!(page_span(Va(0x3000), 0)?, (Va(0x3000), 0));
        assert_eq!(
            page_span(Va(0xffff_ffff_ffff_f000), 0x1000)?,
            (Va(0xffff_ffff_ffff_f000), 1)
        );
        Ok(())
    }

    #[test]
    fn span_rejects_wrapping_range() {
        assert!(matches!(
            page_span(Va(0xffff_ffff_ffff_f000), 0x2000),
            Err(HvError::RangeOverflow {
                address: Va(0xffff_ffff_ffff_f000),
                length: 0x2000
            })
        ));
    }

    #[test]
    fn hints_reject_wrapping_destination() {
        let platform = MockPlatform::new(1);
        let result =
            generate_translation_hints(&platform, ProcessId(8), Va(0xffff_ffff_ffff_fff0), 0x20);

        assert!(matches!(result, Err(HvError::RangeOverflow { length: 0x20, .. })));
    }
}
