use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};

use crate::{GuestPhysAddr, GuestRegion, MmioDevice};

struct Entry {
    region: GuestRegion,
    device: Arc<dyn MmioDevice>,
}

/// The result of a registry lookup.
pub struct MmioHit<'a> {
    pub device: &'a Arc<dyn MmioDevice>,
    /// Offset of the looked up address inside `region`.
    pub offset: usize,
    pub region: GuestRegion,
}

/// Maps disjoint guest physical regions to the devices emulating them.
///
/// Populated while the VM is built and only read afterwards.
#[derive(Default)]
pub struct MmioRegistry {
    regions: BTreeMap<GuestPhysAddr, Entry>,
}

impl MmioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `region` to `device`.
    ///
    /// A region overlapping an existing one is refused with `AlreadyExists`
    /// and the existing binding stays in place.
    pub fn register(&mut self, region: GuestRegion, device: Arc<dyn MmioDevice>) -> AxResult {
        // The only candidates for overlap are the last region starting before
        // `region.end()`; regions are disjoint so that one has the highest end.
        if let Some((_, prev)) = self.regions.range(..region.end()).next_back() {
            if prev.region.overlaps(&region) {
                warn!(
                    "{} {} overlaps {} {}",
                    device.name(),
                    region,
                    prev.device.name(),
                    prev.region
                );
                return ax_err!(AlreadyExists, "overlapping MMIO region");
            }
        }
        debug!("register {} at {}", device.name(), region);
        self.regions.insert(region.start(), Entry { region, device });
        Ok(())
    }

    /// Finds the device whose region contains `addr`.
    pub fn lookup(&self, addr: GuestPhysAddr) -> Option<MmioHit<'_>> {
        let (_, entry) = self.regions.range(..=addr).next_back()?;
        if entry.region.contains(addr) {
            Some(MmioHit {
                device: &entry.device,
                offset: entry.region.offset_of(addr),
                region: entry.region,
            })
        } else {
            None
        }
    }

    /// Registered regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = (GuestRegion, &Arc<dyn MmioDevice>)> {
        self.regions.values().map(|e| (e.region, &e.device))
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}
