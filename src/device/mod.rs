//! Remote Device Capabilities
//!
//! Before a transaction starts the state machines need to know how large an
//! APDU the peer accepts and whether it can take part in segmentation. That
//! knowledge lives behind the [`DeviceDirectory`] trait; [`DeviceInfoCache`]
//! is a simple in-memory implementation fed by the host (typically from I-Am
//! responses).

use std::collections::HashMap;

use log::debug;

use crate::network::Address;

/// Segmentation support enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
pub enum Segmentation {
    #[default]
    Both = 0,
    Transmit = 1,
    Receive = 2,
    NoSegmentation = 3,
}

impl Segmentation {
    /// Can segmented messages be sent
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    /// Can segmented messages be received
    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            other => Err(other),
        }
    }
}

/// What is known about a peer device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: Address,
    pub segmentation_supported: Segmentation,
    pub max_apdu_length_accepted: usize,
    /// `None` when the device did not say
    pub max_segments_accepted: Option<usize>,
}

impl DeviceInfo {
    /// Conservative assumptions for a device nothing is known about: it takes
    /// full-size APDUs but no segmented messages.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            segmentation_supported: Segmentation::NoSegmentation,
            max_apdu_length_accepted: crate::BACNET_MAX_APDU,
            max_segments_accepted: None,
        }
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation_supported = segmentation;
        self
    }

    pub fn with_max_apdu_length(mut self, length: usize) -> Self {
        self.max_apdu_length_accepted = length;
        self
    }

    pub fn with_max_segments(mut self, segments: Option<usize>) -> Self {
        self.max_segments_accepted = segments;
        self
    }
}

/// Resolves a peer address to its capabilities
pub trait DeviceDirectory {
    /// Capabilities of the device at `address`. Implementations return a
    /// default record for unknown devices rather than failing.
    fn lookup(&self, address: &Address) -> DeviceInfo;
}

/// In-memory device directory
#[derive(Debug, Default)]
pub struct DeviceInfoCache {
    devices: HashMap<Address, DeviceInfo>,
}

impl DeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the record for `info.address`
    pub fn update(&mut self, info: DeviceInfo) {
        debug!(
            "device {} accepts {} octets, segmentation {:?}",
            info.address, info.max_apdu_length_accepted, info.segmentation_supported
        );
        self.devices.insert(info.address.clone(), info);
    }

    pub fn remove(&mut self, address: &Address) -> Option<DeviceInfo> {
        self.devices.remove(address)
    }

    pub fn get(&self, address: &Address) -> Option<&DeviceInfo> {
        self.devices.get(address)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl DeviceDirectory for DeviceInfoCache {
    fn lookup(&self, address: &Address) -> DeviceInfo {
        self.devices
            .get(address)
            .cloned()
            .unwrap_or_else(|| DeviceInfo::new(address.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segmentation_capabilities() {
        assert!(Segmentation::Both.can_transmit());
        assert!(Segmentation::Both.can_receive());
        assert!(Segmentation::Transmit.can_transmit());
        assert!(!Segmentation::Transmit.can_receive());
        assert!(!Segmentation::Receive.can_transmit());
        assert!(!Segmentation::NoSegmentation.can_receive());
        assert_eq!(Segmentation::try_from(2), Ok(Segmentation::Receive));
        assert_eq!(Segmentation::try_from(9), Err(9));
    }

    #[test]
    fn test_cache_lookup() {
        let peer = Address::LocalStation(vec![10, 0, 0, 2, 0xBA, 0xC0]);
        let mut cache = DeviceInfoCache::new();

        let unknown = cache.lookup(&peer);
        assert_eq!(unknown.segmentation_supported, Segmentation::NoSegmentation);
        assert_eq!(unknown.max_apdu_length_accepted, 1476);
        assert!(cache.is_empty());

        cache.update(
            DeviceInfo::new(peer.clone())
                .with_segmentation(Segmentation::Both)
                .with_max_apdu_length(480)
                .with_max_segments(Some(16)),
        );
        let known = cache.lookup(&peer);
        assert_eq!(known.max_apdu_length_accepted, 480);
        assert_eq!(known.max_segments_accepted, Some(16));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(&peer).is_some());
        assert!(cache.get(&peer).is_none());
    }
}
