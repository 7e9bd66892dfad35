//! Minor-number registry
//!
//! Maps the logical address sessions open (a minor number) to the published
//! device object. The registry entry is the device's "attached" reference:
//! publishing stores one `Arc`, unpublishing hands it back to the caller.

use crate::error::{DriverError, Result};
use crate::usb::device::UsbSkel;
use common::BusLocation;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Logical address of a published device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Minor(pub u32);

impl fmt::Display for Minor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct Entries {
    devices: HashMap<Minor, Arc<UsbSkel>>,
    by_location: HashMap<BusLocation, Minor>,
}

/// Registry of published devices
pub struct DeviceRegistry {
    entries: Mutex<Entries>,
    minor_base: u32,
    max_minors: u32,
}

impl DeviceRegistry {
    pub fn new(minor_base: u32, max_minors: u32) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            minor_base,
            max_minors,
        }
    }

    /// Publish `device` under the lowest free minor
    ///
    /// A location can carry only one published device; a second attach at
    /// the same location is refused until the first is unpublished.
    pub fn publish(&self, device: Arc<UsbSkel>) -> Result<Minor> {
        let mut entries = self.lock();
        let location = device.location();
        if let Some(existing) = entries.by_location.get(&location) {
            debug!("Location {} already published as minor {}", location, existing);
            return Err(DriverError::AlreadyAttached(location));
        }

        let end = self.minor_base.saturating_add(self.max_minors);

        let minor = (self.minor_base..end)
            .map(Minor)
            .find(|minor| !entries.devices.contains_key(minor))
            .ok_or(DriverError::MinorsExhausted {
                base: self.minor_base,
                end,
            })?;

        entries.by_location.insert(location, minor);
        entries.devices.insert(minor, device);
        debug!("Published minor {}", minor);
        Ok(minor)
    }

    /// Remove `minor`, returning the registry's reference to its device
    pub fn unpublish(&self, minor: Minor) -> Option<Arc<UsbSkel>> {
        let mut entries = self.lock();
        let device = entries.devices.remove(&minor)?;
        entries.by_location.remove(&device.location());
        debug!("Unpublished minor {}", minor);
        Some(device)
    }

    /// Remove `minor` only if it still maps to `device`
    ///
    /// Detach uses this so a minor that was released and handed to a newly
    /// attached device in the meantime is left alone.
    pub fn unpublish_device(&self, minor: Minor, device: &Arc<UsbSkel>) -> Option<Arc<UsbSkel>> {
        let mut entries = self.lock();
        if !entries
            .devices
            .get(&minor)
            .is_some_and(|published| Arc::ptr_eq(published, device))
        {
            return None;
        }
        let removed = entries.devices.remove(&minor)?;
        entries.by_location.remove(&removed.location());
        debug!("Unpublished minor {}", minor);
        Some(removed)
    }

    /// Take a new reference to the device published under `minor`
    pub fn lookup(&self, minor: Minor) -> Option<Arc<UsbSkel>> {
        self.lock().devices.get(&minor).cloned()
    }

    /// Find the published device at a bus location
    pub fn find_by_location(&self, location: BusLocation) -> Option<(Minor, Arc<UsbSkel>)> {
        let entries = self.lock();
        let minor = *entries.by_location.get(&location)?;
        let device = entries.devices.get(&minor)?;
        Some((minor, Arc::clone(device)))
    }

    /// Strong reference count of a published device, without taking one
    pub fn ref_count(&self, minor: Minor) -> Option<usize> {
        self.lock().devices.get(&minor).map(Arc::strong_count)
    }

    /// Published minors in ascending order
    pub fn minors(&self) -> Vec<Minor> {
        let mut minors: Vec<Minor> = self.lock().devices.keys().copied().collect();
        minors.sort();
        minors
    }

    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("minor_base", &self.minor_base)
            .field("max_minors", &self.max_minors)
            .field("minors", &self.minors())
            .finish()
    }
}
