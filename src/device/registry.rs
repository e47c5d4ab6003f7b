use indexmap::IndexMap;

use crate::device::types::PeripheralIdentity;

/// First peripheral whose name contains `needle`, ignoring case.
pub fn match_name<'a>(
    devices: impl IntoIterator<Item = &'a PeripheralIdentity>,
    needle: &str,
) -> Option<&'a PeripheralIdentity> {
    let needle = needle.to_lowercase();
    devices.into_iter().find(|identity| {
        identity.name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&needle))
            .unwrap_or(false)
    })
}

/// Peripherals found by the current scan, keyed by identifier.
#[derive(Debug, Clone, Default)]
pub struct ScanRegistry {
    devices: IndexMap<String, PeripheralIdentity>,
}

impl ScanRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if a peripheral with the same identifier was already known. A name that
    /// was missing from the first advertisement is filled in.
    pub fn insert(&mut self, identity: PeripheralIdentity) -> bool {
        if let Some(known) = self.devices.get_mut(&identity.id) {
            if known.name.is_none() {
                known.name = identity.name;
            }
            return false;
        }

        self.devices.insert(identity.id.clone(), identity);
        true
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralIdentity> {
        self.devices.get(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeripheralIdentity> {
        self.devices.values()
    }

    pub fn to_vec(&self) -> Vec<PeripheralIdentity> {
        self.iter().cloned().collect()
    }
}
