//! Device discovery for finding OBD-II adapters

use obd_ble_shared::timing;
use std::time::Duration;

/// What to do when an address is seen again during the same scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep the first sighting untouched
    #[default]
    KeepFirst,
    /// Update name and signal strength in place
    Refresh,
}

/// Configuration for a discovery pass
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// How long to scan before stopping automatically
    pub scan_duration: Duration,
    /// Case-insensitive substrings; a device is kept if its name contains any
    pub name_patterns: Vec<String>,
    /// Handling of repeated advertisements from one address
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_duration: Duration::from_millis(timing::SCAN_DURATION_MS),
            name_patterns: ["OBD", "ELM", "VLINK", "V-LINK", "VEEPEAK", "KONNWEI", "VGATE"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            duplicate_policy: DuplicatePolicy::KeepFirst,
        }
    }
}

/// An adapter seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub name: Option<String>,
    /// Hardware address, unique within one scan
    pub address: String,
    /// Signal strength in dBm
    pub rssi: i16,
}

/// Devices found by the current scan, in first-seen order
#[derive(Debug, Default)]
pub struct DiscoveredDevices {
    devices: Vec<DiscoveredDevice>,
    policy: DuplicatePolicy,
    patterns: Vec<String>,
}

impl DiscoveredDevices {
    pub fn new(config: &ScanConfig) -> Self {
        Self {
            devices: Vec::new(),
            policy: config.duplicate_policy,
            patterns: config
                .name_patterns
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        }
    }

    /// Check if an advertised name looks like an OBD-II adapter
    pub fn is_adapter_name(&self, name: Option<&str>) -> bool {
        let Some(name) = name else {
            return false;
        };
        let name = name.to_lowercase();
        self.patterns.iter().any(|p| name.contains(p.as_str()))
    }

    /// Record an advertisement
    ///
    /// Addresses are stored uppercase. Returns true if the published set changed.
    pub fn record(&mut self, name: Option<String>, address: String, rssi: i16) -> bool {
        if !self.is_adapter_name(name.as_deref()) {
            return false;
        }
        let address = address.to_ascii_uppercase();

        if let Some(existing) = self.devices.iter_mut().find(|d| d.address == address) {
            return match self.policy {
                DuplicatePolicy::KeepFirst => false,
                DuplicatePolicy::Refresh => {
                    let changed = existing.name != name || existing.rssi != rssi;
                    existing.name = name;
                    existing.rssi = rssi;
                    changed
                }
            };
        }

        self.devices.push(DiscoveredDevice { name, address, rssi });
        true
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
        self.devices.clone()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
