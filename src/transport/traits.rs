//! Platform abstraction for pluggable BLE backends
//!
//! A backend exposes request-style operations through [`BlePlatform`] and
//! reports its asynchronous callbacks as [`HardwareEvent`] messages on an
//! unbounded channel handed out by its constructor. Sending on that channel
//! never blocks, so callbacks can be forwarded straight from the platform's
//! own context.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Sender half used by backends to report callbacks
pub type HardwareEventSender = mpsc::UnboundedSender<HardwareEvent>;

/// Receiver half consumed by the connection manager
pub type HardwareEventReceiver = mpsc::UnboundedReceiver<HardwareEvent>;

/// Asynchronous callbacks from the BLE stack
#[derive(Debug, Clone, PartialEq)]
pub enum HardwareEvent {
    /// An advertisement was seen during a scan
    Advertisement {
        name: Option<String>,
        address: String,
        rssi: i16,
    },
    /// The scan could not continue
    ScanFailed { code: i32 },
    /// The link to `address` is up
    Connected { address: String },
    /// The link to `address` went down, or never came up
    Disconnected { address: String, reason: String },
    /// A subscribed characteristic changed value
    Notification {
        characteristic: CharacteristicRef,
        value: Vec<u8>,
    },
}

/// Whether the stack can be used at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Ready,
    PermissionDenied,
    AdapterMissing,
    AdapterDisabled,
}

/// Capabilities advertised by a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties {
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Address of a characteristic within the connected device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

impl GattService {
    /// Find a characteristic of this service by UUID
    pub fn characteristic(&self, uuid: Uuid) -> Option<CharacteristicRef> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .map(|c| CharacteristicRef {
                service: self.uuid,
                characteristic: c.uuid,
            })
    }
}

/// Request-style operations of a BLE stack
///
/// Connection outcomes are not returned from `connect`; they arrive later as
/// `Connected` / `Disconnected` events.
#[async_trait]
pub trait BlePlatform: Send + Sync + 'static {
    /// Check permission and adapter state
    async fn availability(&self) -> Availability;

    /// Begin reporting advertisements
    async fn start_scan(&self) -> Result<()>;

    /// Stop reporting advertisements; must be safe when no scan runs
    async fn stop_scan(&self) -> Result<()>;

    /// Request a connection to `address`
    async fn connect(&self, address: &str) -> Result<()>;

    /// Release the connection to `address`
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Enumerate the services of the connected device
    async fn discover_services(&self, address: &str) -> Result<Vec<GattService>>;

    /// Enable notifications on `characteristic`
    async fn subscribe(&self, address: &str, characteristic: &CharacteristicRef) -> Result<()>;

    /// Write `data` and wait for the stack to confirm it
    async fn write(
        &self,
        address: &str,
        characteristic: &CharacteristicRef,
        data: Bytes,
    ) -> Result<()>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}
