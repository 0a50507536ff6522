pub mod discovery;
pub mod session;
pub mod traits;

#[cfg(feature = "bluez")]
pub mod bluez;

#[cfg(test)]
pub(crate) mod mock;

#[cfg(feature = "bluez")]
pub use bluez::BluerPlatform;
pub use discovery::{DiscoveredDevice, DiscoveredDevices, DuplicatePolicy, ScanConfig};
pub use session::{
    ble_uuid, default_strategies, FirstCapable, KnownProfile, ResolutionStrategy,
    ResolvedCharacteristics, TransportSession,
};
pub use traits::{
    Availability, BlePlatform, CharacteristicProperties, CharacteristicRef, GattCharacteristic,
    GattService, HardwareEvent, HardwareEventReceiver, HardwareEventSender,
};
