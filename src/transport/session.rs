//! Transport session: the live link to one adapter
//!
//! Holds the resolved write/notify characteristics and the inbound framing
//! buffer. Characteristic resolution runs an ordered list of strategies over
//! the discovered services; the first strategy that finds a writable
//! characteristic wins.

use crate::transport::traits::{CharacteristicRef, GattService};
use obd_ble_shared::codec::FrameDecoder;
use tracing::warn;
use uuid::Uuid;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Characteristics the session talks through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedCharacteristics {
    pub write: CharacteristicRef,
    /// Absent when the device exposes nothing notifiable
    pub notify: Option<CharacteristicRef>,
}

/// One way of locating the UART characteristics
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(&self, services: &[GattService]) -> Option<ResolvedCharacteristics>;
}

/// A fixed service/write/notify UUID triple
#[derive(Debug, Clone)]
pub struct KnownProfile {
    pub name: &'static str,
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

impl KnownProfile {
    /// FFF0 service used by most ELM327 BLE clones
    pub const ELM327_FFF0: KnownProfile = KnownProfile {
        name: "ELM327 FFF0",
        service: ble_uuid(0xfff0),
        write: ble_uuid(0xfff2),
        notify: ble_uuid(0xfff1),
    };

    /// HM-10 style module with one characteristic for both directions
    pub const HM10_FFE0: KnownProfile = KnownProfile {
        name: "HM-10 FFE0",
        service: ble_uuid(0xffe0),
        write: ble_uuid(0xffe1),
        notify: ble_uuid(0xffe1),
    };

    pub const NORDIC_UART: KnownProfile = KnownProfile {
        name: "Nordic UART",
        service: Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e),
        write: Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e),
        notify: Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e),
    };
}

impl ResolutionStrategy for KnownProfile {
    fn name(&self) -> &'static str {
        self.name
    }

    fn resolve(&self, services: &[GattService]) -> Option<ResolvedCharacteristics> {
        let service = services.iter().find(|s| s.uuid == self.service)?;
        let write = service.characteristic(self.write)?;
        Some(ResolvedCharacteristics {
            write,
            notify: service.characteristic(self.notify),
        })
    }
}

/// Fallback: first writable and first notifiable characteristic anywhere
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstCapable;

impl ResolutionStrategy for FirstCapable {
    fn name(&self) -> &'static str {
        "first capable characteristic"
    }

    fn resolve(&self, services: &[GattService]) -> Option<ResolvedCharacteristics> {
        let all = || {
            services.iter().flat_map(|s| {
                s.characteristics.iter().map(move |c| {
                    (
                        CharacteristicRef {
                            service: s.uuid,
                            characteristic: c.uuid,
                        },
                        c.properties,
                    )
                })
            })
        };

        let write = all().find(|(_, p)| p.can_write()).map(|(r, _)| r)?;
        // Prefer plain notify over indicate
        let notify = all()
            .find(|(_, p)| p.notify)
            .or_else(|| all().find(|(_, p)| p.indicate))
            .map(|(r, _)| r);

        Some(ResolvedCharacteristics { write, notify })
    }
}

/// Known profiles first, then the scan-everything fallback
pub fn default_strategies() -> Vec<Box<dyn ResolutionStrategy>> {
    vec![
        Box::new(KnownProfile::ELM327_FFF0),
        Box::new(KnownProfile::HM10_FFE0),
        Box::new(KnownProfile::NORDIC_UART),
        Box::new(FirstCapable),
    ]
}

/// Run strategies in order, returning the winner's name and result
pub fn resolve_characteristics(
    strategies: &[Box<dyn ResolutionStrategy>],
    services: &[GattService],
) -> Option<(&'static str, ResolvedCharacteristics)> {
    strategies
        .iter()
        .find_map(|s| s.resolve(services).map(|r| (s.name(), r)))
}

/// The live link to one adapter
#[derive(Debug)]
pub struct TransportSession {
    address: String,
    characteristics: Option<ResolvedCharacteristics>,
    decoder: FrameDecoder,
}

impl TransportSession {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            characteristics: None,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Install resolved characteristics
    pub fn attach(&mut self, characteristics: ResolvedCharacteristics) {
        self.characteristics = Some(characteristics);
    }

    /// Outbound endpoint, if resolved
    pub fn write_characteristic(&self) -> Option<CharacteristicRef> {
        self.characteristics.map(|c| c.write)
    }

    /// Inbound endpoint, if resolved
    pub fn notify_characteristic(&self) -> Option<CharacteristicRef> {
        self.characteristics.and_then(|c| c.notify)
    }

    /// Feed a notification chunk, returning the completed response if any
    pub fn on_notification(&mut self, characteristic: &CharacteristicRef, chunk: &[u8]) -> Option<String> {
        if self.notify_characteristic().as_ref() != Some(characteristic) {
            return None;
        }

        self.decoder.extend(chunk);
        match self.decoder.decode_next() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[BLE] Discarding inbound data from {}: {}", self.address, e);
                None
            }
        }
    }

    /// Drop characteristic references and any partial frame
    ///
    /// Safe to call more than once.
    pub fn teardown(&mut self) {
        self.characteristics = None;
        self.decoder.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::traits::{CharacteristicProperties, GattCharacteristic};

    fn characteristic(uuid: Uuid, write: bool, notify: bool) -> GattCharacteristic {
        GattCharacteristic {
            uuid,
            properties: CharacteristicProperties {
                write,
                notify,
                ..Default::default()
            },
        }
    }

    fn fff0_service() -> GattService {
        GattService {
            uuid: ble_uuid(0xfff0),
            characteristics: vec![
                characteristic(ble_uuid(0xfff1), false, true),
                characteristic(ble_uuid(0xfff2), true, false),
            ],
        }
    }

    fn generic_access() -> GattService {
        GattService {
            uuid: ble_uuid(0x1800),
            characteristics: vec![characteristic(ble_uuid(0x2a00), false, false)],
        }
    }

    #[test]
    fn test_ble_uuid() {
        assert_eq!(
            ble_uuid(0xfff0).to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_known_profile_wins() {
        let services = vec![generic_access(), fff0_service()];
        let (name, resolved) = resolve_characteristics(&default_strategies(), &services).unwrap();
        assert_eq!(name, "ELM327 FFF0");
        assert_eq!(resolved.write.characteristic, ble_uuid(0xfff2));
        assert_eq!(resolved.notify.unwrap().characteristic, ble_uuid(0xfff1));
    }

    #[test]
    fn test_fallback_scans_all_services() {
        let custom = GattService {
            uuid: Uuid::from_u128(0xe7810a71_73ae_499d_8c15_faa9aef0c3f2),
            characteristics: vec![
                characteristic(Uuid::from_u128(10), false, false),
                characteristic(Uuid::from_u128(11), false, true),
                characteristic(Uuid::from_u128(12), true, false),
            ],
        };
        let services = vec![generic_access(), custom];
        let (name, resolved) = resolve_characteristics(&default_strategies(), &services).unwrap();
        assert_eq!(name, "first capable characteristic");
        assert_eq!(resolved.write.characteristic, Uuid::from_u128(12));
        assert_eq!(resolved.notify.unwrap().characteristic, Uuid::from_u128(11));
    }

    #[test]
    fn test_indicate_used_when_no_notify() {
        let service = GattService {
            uuid: Uuid::from_u128(1),
            characteristics: vec![
                GattCharacteristic {
                    uuid: Uuid::from_u128(2),
                    properties: CharacteristicProperties {
                        indicate: true,
                        ..Default::default()
                    },
                },
                characteristic(Uuid::from_u128(3), true, false),
            ],
        };
        let resolved = FirstCapable.resolve(&[service]).unwrap();
        assert_eq!(resolved.notify.unwrap().characteristic, Uuid::from_u128(2));
    }

    #[test]
    fn test_no_writable_characteristic() {
        let services = vec![generic_access()];
        assert!(resolve_characteristics(&default_strategies(), &services).is_none());
    }

    #[test]
    fn test_session_frames_notifications() {
        let mut session = TransportSession::new("AA:BB:CC:DD:EE:FF");
        let resolved = KnownProfile::ELM327_FFF0.resolve(&[fff0_service()]).unwrap();
        session.attach(resolved);
        let notify = resolved.notify.unwrap();

        assert_eq!(session.on_notification(&notify, b"41 0C "), None);
        assert_eq!(
            session.on_notification(&notify, b"1A F8\r\r>"),
            Some("41 0C 1A F8".to_string())
        );
    }

    #[test]
    fn test_session_ignores_other_characteristics() {
        let mut session = TransportSession::new("AA:BB:CC:DD:EE:FF");
        session.attach(KnownProfile::ELM327_FFF0.resolve(&[fff0_service()]).unwrap());
        let other = CharacteristicRef {
            service: ble_uuid(0x1800),
            characteristic: ble_uuid(0x2a00),
        };
        assert_eq!(session.on_notification(&other, b"OK\r>"), None);
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let mut session = TransportSession::new("AA:BB:CC:DD:EE:FF");
        session.attach(KnownProfile::ELM327_FFF0.resolve(&[fff0_service()]).unwrap());
        session.teardown();
        session.teardown();
        assert!(session.write_characteristic().is_none());
        assert!(session.notify_characteristic().is_none());
    }
}
