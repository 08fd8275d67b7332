//! In-memory capability store

use super::CapabilityStore;
use crate::{DeviceCapability, Result, SenseError};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// In-memory [`CapabilityStore`]
#[derive(Default)]
pub struct MemoryCapabilityStore {
    by_device: RwLock<HashMap<Uuid, Vec<DeviceCapability>>>,
}

impl MemoryCapabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(&self) -> Vec<DeviceCapability> {
        self.by_device.read().values().flatten().cloned().collect()
    }

    pub fn restore(&self, capabilities: Vec<DeviceCapability>) {
        let mut by_device = self.by_device.write();
        by_device.clear();
        for c in capabilities {
            by_device.entry(c.device_id).or_default().push(c);
        }
    }
}

impl CapabilityStore for MemoryCapabilityStore {
    fn find_by_device(&self, device_id: Uuid) -> Result<Vec<DeviceCapability>> {
        Ok(self
            .by_device
            .read()
            .get(&device_id)
            .cloned()
            .unwrap_or_default())
    }

    fn find_by_device_and_ability(
        &self,
        device_id: Uuid,
        ability: &str,
    ) -> Result<Option<DeviceCapability>> {
        Ok(self
            .by_device
            .read()
            .get(&device_id)
            .and_then(|caps| caps.iter().find(|c| c.ability == ability).cloned()))
    }

    fn create(&self, capability: DeviceCapability) -> Result<DeviceCapability> {
        if capability.ability.trim().is_empty() {
            return Err(SenseError::InvalidArgument(
                "capability ability can't be blank".into(),
            ));
        }

        let mut by_device = self.by_device.write();
        let caps = by_device.entry(capability.device_id).or_default();
        // Concurrent first sightings of one key resolve to the earlier row
        if let Some(existing) = caps.iter().find(|c| c.ability == capability.ability) {
            return Ok(existing.clone());
        }
        caps.push(capability.clone());
        Ok(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_unique_per_ability() {
        let store = MemoryCapabilityStore::new();
        let device = Uuid::now_v7();

        let first = store.create(DeviceCapability::scalar(device, "temp")).unwrap();
        let again = store.create(DeviceCapability::scalar(device, "temp")).unwrap();
        assert_eq!(first.id, again.id);

        store
            .create(DeviceCapability::image(device, "plate", vec!["number".into()], None))
            .unwrap();
        assert_eq!(store.find_by_device(device).unwrap().len(), 2);
        assert!(store.find_by_device_and_ability(device, "hum").unwrap().is_none());
    }

    #[test]
    fn test_blank_ability_rejected() {
        let store = MemoryCapabilityStore::new();
        let err = store.create(DeviceCapability::scalar(Uuid::now_v7(), "  ")).unwrap_err();
        assert!(err.is_caller_error());
    }
}
