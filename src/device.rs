//! Device slots and provisioning.
//!
//! A device slot is one provisioned execution target (for example a booted
//! simulator instance) capable of running one batch of tests at a time. The
//! scheduling core only remembers the current instance identifier of a slot;
//! creating, resetting and destroying the underlying instances is delegated
//! to a [`DeviceProvider`].
//!
//! # Built-in Providers
//!
//! | Provider | Description |
//! |----------|-------------|
//! | [`LocalDeviceProvider`] | Fabricates local pseudo-devices, no external dependencies |
//!
//! Real backends (a simulator farm, a device lab) implement [`DeviceProvider`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::DevicesConfig;

/// Result type for device provisioning operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur during device provisioning.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// No devices could be created.
    #[error("Failed to provision devices: {0}")]
    ProvisionFailed(String),

    /// A device could not be reset to a fresh instance.
    #[error("Failed to reset device {name}: {reason}")]
    ResetFailed { name: String, reason: String },

    /// I/O error talking to the provisioning backend.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Provider-specific error not covered by other variants.
    #[error("Device provider error: {0}")]
    Other(#[from] anyhow::Error),
}

/// One provisioned execution target.
///
/// The slot is the stable identity across retries: the family and name stay
/// fixed while the instance identifier is exchanged for a fresh one each
/// time the slot is re-provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSlot {
    /// Device family tag, e.g. `"iPhone 6"`.
    pub family: String,

    /// Human-readable slot name, used to attribute log output.
    pub name: String,

    /// Identifier of the currently provisioned instance.
    pub instance_id: String,
}

impl DeviceSlot {
    /// Returns the same slot bound to a freshly provisioned instance.
    pub fn with_instance(&self, instance_id: impl Into<String>) -> DeviceSlot {
        DeviceSlot {
            family: self.family.clone(),
            name: self.name.clone(),
            instance_id: instance_id.into(),
        }
    }
}

/// A device created by a provider, before it is bound to a slot.
#[derive(Debug, Clone)]
pub struct ProvisionedDevice {
    pub name: String,
    pub instance_id: String,
}

/// Creates, resets and destroys device instances.
///
/// The scheduling core calls [`reset_and_create_devices`](Self::reset_and_create_devices)
/// once at run start, [`reset_device`](Self::reset_device) each time a slot
/// is recycled for a retry, and [`kill_and_delete_all`](Self::kill_and_delete_all)
/// on both startup (to clear leftovers) and teardown.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Tears down any stale instances and creates a fresh set, grouped by
    /// device family.
    async fn reset_and_create_devices(
        &self,
    ) -> DeviceResult<BTreeMap<String, Vec<ProvisionedDevice>>>;

    /// Replaces the slot's instance with a fresh one.
    ///
    /// Returns the new instance identifier, or `None` if the backend could
    /// not produce one; the caller then keeps using the old identifier.
    async fn reset_device(&self, slot: &DeviceSlot) -> DeviceResult<Option<String>>;

    /// Destroys every instance this provider created.
    async fn kill_and_delete_all(&self) -> DeviceResult<()>;
}

/// Provider that fabricates local pseudo-devices.
///
/// This is the simplest provider implementation. Each device is just an
/// identifier handed to the executor command; there is no real instance to
/// boot or destroy. Useful for development, for harnesses that manage their
/// own isolation, and for exercising the scheduling core.
pub struct LocalDeviceProvider {
    families: BTreeMap<String, usize>,
}

impl LocalDeviceProvider {
    /// Creates a provider that fabricates `count` devices per family.
    pub fn new(families: BTreeMap<String, usize>) -> Self {
        Self { families }
    }

    /// Creates a provider from the `[devices]` configuration section.
    pub fn from_config(config: &DevicesConfig) -> Self {
        Self::new(config.families.clone())
    }
}

#[async_trait]
impl DeviceProvider for LocalDeviceProvider {
    async fn reset_and_create_devices(
        &self,
    ) -> DeviceResult<BTreeMap<String, Vec<ProvisionedDevice>>> {
        if self.families.is_empty() {
            return Err(DeviceError::ProvisionFailed(
                "no device families configured".to_string(),
            ));
        }

        let mut devices = BTreeMap::new();
        for (family, count) in &self.families {
            let instances: Vec<ProvisionedDevice> = (0..*count)
                .map(|i| ProvisionedDevice {
                    name: format!("{} {}", family, i + 1),
                    instance_id: Uuid::new_v4().to_string(),
                })
                .collect();
            devices.insert(family.clone(), instances);
        }

        Ok(devices)
    }

    async fn reset_device(&self, _slot: &DeviceSlot) -> DeviceResult<Option<String>> {
        Ok(Some(Uuid::new_v4().to_string()))
    }

    async fn kill_and_delete_all(&self) -> DeviceResult<()> {
        // Pseudo-devices have nothing to tear down.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn families() -> BTreeMap<String, usize> {
        let mut families = BTreeMap::new();
        families.insert("iPhone 6".to_string(), 2);
        families.insert("iPad Air".to_string(), 1);
        families
    }

    #[tokio::test]
    async fn creates_requested_counts_per_family() {
        let provider = LocalDeviceProvider::new(families());
        let devices = provider.reset_and_create_devices().await.unwrap();

        assert_eq!(devices["iPhone 6"].len(), 2);
        assert_eq!(devices["iPad Air"].len(), 1);
        assert_eq!(devices["iPhone 6"][0].name, "iPhone 6 1");
        assert_eq!(devices["iPhone 6"][1].name, "iPhone 6 2");
    }

    #[tokio::test]
    async fn instance_ids_are_unique() {
        let provider = LocalDeviceProvider::new(families());
        let devices = provider.reset_and_create_devices().await.unwrap();

        let ids: Vec<&str> = devices
            .values()
            .flatten()
            .map(|d| d.instance_id.as_str())
            .collect();
        let unique: std::collections::HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(ids.len(), unique.len());
    }

    #[tokio::test]
    async fn reset_produces_a_fresh_instance() {
        let provider = LocalDeviceProvider::new(families());
        let slot = DeviceSlot {
            family: "iPhone 6".to_string(),
            name: "iPhone 6 1".to_string(),
            instance_id: "old".to_string(),
        };

        let new_id = provider.reset_device(&slot).await.unwrap().unwrap();
        assert_ne!(new_id, "old");
    }

    #[tokio::test]
    async fn empty_families_fail_provisioning() {
        let provider = LocalDeviceProvider::new(BTreeMap::new());
        assert!(provider.reset_and_create_devices().await.is_err());
    }

    #[test]
    fn with_instance_keeps_identity() {
        let slot = DeviceSlot {
            family: "iPhone 6".to_string(),
            name: "iPhone 6 1".to_string(),
            instance_id: "old".to_string(),
        };
        let fresh = slot.with_instance("new");
        assert_eq!(fresh.family, slot.family);
        assert_eq!(fresh.name, slot.name);
        assert_eq!(fresh.instance_id, "new");
    }
}
