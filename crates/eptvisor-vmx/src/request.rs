//! Requests handed to the hypervisor by its control surface.

use eptvisor_core::{HvError, PAGE_SIZE, Pa, ProcessId, Va};
use serde::{Deserialize, Serialize};

use crate::{ept::page_span, platform::AddressSpace};

/// A request to patch the code of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRequest {
    /// Process whose code is patched.
    pub process_id: ProcessId,

    /// First byte to patch.
    pub target_address: Va,

    /// Bytes shown to instruction fetches.
    pub payload: Vec<u8>,
}

impl HookRequest {
    /// Creates a new hook request.
    pub fn new(process_id: ProcessId, target_address: Va, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            process_id,
            target_address,
            payload: payload.into(),
        }
    }

    /// Rejects requests that cannot be installed as a single patch.
    pub fn check(&self) -> Result<(), HvError> {
        if self.payload.is_empty() {
            return Err(HvError::EmptyPayload);
        }

        let offset = self.target_address.page_offset();
        if offset + self.payload.len() as u64 > PAGE_SIZE {
            return Err(HvError::PageBoundary {
                offset,
                length: self.payload.len(),
            });
        }

        Ok(())
    }
}

/// A virtual address range to watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRegion {
    /// First byte of the region.
    pub address: Va,

    /// Length of the region in bytes.
    pub length: usize,
}

impl WatchRegion {
    /// Returns the base of every page the region touches.
    ///
    /// Fails if the region wraps around the end of the address space.
    pub fn pages(&self) -> Result<impl Iterator<Item = Va> + use<>, HvError> {
        let (first, count) = page_span(self.address, self.length)?;
        Ok((0..count).map(move |index| first + index * PAGE_SIZE))
    }
}

/// A request to watch data accesses to the code of a process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    /// Process whose memory is watched.
    pub process_id: ProcessId,

    /// Regions to watch.
    pub regions: Vec<WatchRegion>,
}

impl WatchRequest {
    /// Resolves every page of every region to its physical base.
    ///
    /// Pages shared by several regions are resolved once.
    pub fn resolve(&self, space: &impl AddressSpace) -> Result<Vec<Pa>, HvError> {
        let mut pages = Vec::new();

        for region in &self.regions {
            for va in region.pages()? {
                let pa = space
                    .translate(self.process_id, va)
                    .ok_or(HvError::TranslationFailed(va))?
                    .page_base();

                if !pages.contains(&pa) {
                    pages.push(pa);
                }
            }
        }

        Ok(pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPlatform;

    #[test]
    fn hook_request_rejects_page_crossing() {
        let request = HookRequest::new(ProcessId(8), Va(0x7ff6_0000_0ffe), [0xcc; 4]);
        assert!(matches!(
            request.check(),
            Err(HvError::PageBoundary {
                offset: 0xffe,
                length: 4
            })
        ));

        let request = HookRequest::new(ProcessId(8), Va(0x7ff6_0000_0ffc), [0xcc; 4]);
        assert!(request.check().is_ok());
    }

    #[test]
    fn hook_request_rejects_empty_payload() {
        let request = HookRequest::new(ProcessId(8), Va(0x7ff6_0000_1000), Vec::new());
        assert!(matches!(request.check(), Err(HvError::EmptyPayload)));
    }

    #[test]
    fn region_pages() -> Result<(), HvError> {
        let region = WatchRegion {
            address: Va(0x1ff0),
            length: 0x20,
        };
        assert_eq!(region.pages()?.collect::<Vec<_>>(), [Va(0x1000), Va(0x2000)]);

        let region = WatchRegion {
            address: Va(0x3000),
            length: 0x1000,
        };
        assert_eq!(region.pages()?.collect::<Vec<_>>(), [Va(0x3000)]);

        let region = WatchRegion {
            address: Va(0x3000),
            length: 0,
        };
        assert_eq!(region.pages()?.count(), 0);
        Ok(())
    }

    #[test]
    fn region_wrapping_address_space_is_rejected() {
        let region = WatchRegion {
            address: Va(0xffff_ffff_ffff_f000),
            length: 0x2000,
        };
        assert!(matches!(
            region.pages(),
            Err(HvError::RangeOverflow { length: 0x2000, .. })
        ));

        let platform = MockPlatform::new(1);
        let request = WatchRequest {
            process_id: ProcessId(0x1f4),
            regions: vec![region],
        };
        assert!(matches!(
            request.resolve(&platform),
            Err(HvError::RangeOverflow { .. })
        ));
    }

    #[test]
    fn watch_request_resolves_pages() -> Result<(), HvError> {
        let platform = MockPlatform::new(1);
        let pid = ProcessId(0x1f4);
        platform.map_process(pid, Va(0x7ff6_0000_0000), Pa(0x20_0000));
        platform.map_process(pid, Va(0x7ff6_0000_1000), Pa(0x35_4000));

        let request = WatchRequest {
            process_id: pid,
            regions: vec![
                WatchRegion {
                    address: Va(0x7ff6_0000_0ff0),
                    length: 0x20,
                },
                WatchRegion {
                    address: Va(0x7ff6_0000_0100),
                    length: 8,
                },
            ],
        };

        assert_eq!(request.resolve(&platform)?, [Pa(0x20_0000), Pa(0x35_4000)]);
        Ok(())
    }

    #[test]
    fn watch_request_reports_unmapped_page() {
        let platform = MockPlatform::new(1);
        let request = WatchRequest {
            process_id: ProcessId(0x1f4),
            regions: vec![WatchRegion {
                address: Va(0x7ff6_0000_0000),
                length: 1,
            }],
        };

        assert!(matches!(
            request.resolve(&platform),
            Err(HvError::TranslationFailed(Va(0x7ff6_0000_0000)))
        ));
    }
}
