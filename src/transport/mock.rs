//! Scriptable in-memory backend for tests

use crate::transport::session::ble_uuid;
use crate::transport::traits::{
    Availability, BlePlatform, CharacteristicProperties, CharacteristicRef, GattCharacteristic,
    GattService, HardwareEvent, HardwareEventReceiver, HardwareEventSender,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How the mock answers one `connect` call
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    /// Report `Connected`
    Succeed,
    /// Report `Disconnected` with this reason
    DropLink(String),
    /// Fail the request itself
    Reject(String),
    /// Accept the request and never call back
    Silent,
}

struct MockState {
    availability: Availability,
    connect_script: VecDeque<ConnectOutcome>,
    default_connect: ConnectOutcome,
    services: Vec<GattService>,
    responses: HashMap<String, String>,
    subscribed: Option<CharacteristicRef>,
    fail_writes: bool,
    fail_disconnects: bool,
    connect_calls: Vec<String>,
    disconnect_calls: Vec<String>,
    writes: Vec<String>,
    scan_starts: usize,
    scan_stops: usize,
}

pub struct MockPlatform {
    events: HardwareEventSender,
    state: Mutex<MockState>,
}

impl MockPlatform {
    pub fn new() -> (Arc<Self>, HardwareEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        let responses = [
            ("ATZ", "ELM327 v1.5"),
            ("ATE0", "OK"),
            ("ATL0", "OK"),
            ("ATS0", "OK"),
            ("ATSP0", "OK"),
        ]
        .into_iter()
        .map(|(c, r)| (c.to_string(), r.to_string()))
        .collect();

        let platform = Arc::new(Self {
            events,
            state: Mutex::new(MockState {
                availability: Availability::Ready,
                connect_script: VecDeque::new(),
                default_connect: ConnectOutcome::Succeed,
                services: vec![Self::elm327_service(), Self::generic_access_service()],
                responses,
                subscribed: None,
                fail_writes: false,
                fail_disconnects: false,
                connect_calls: Vec::new(),
                disconnect_calls: Vec::new(),
                writes: Vec::new(),
                scan_starts: 0,
                scan_stops: 0,
            }),
        });
        (platform, rx)
    }

    pub fn elm327_service() -> GattService {
        GattService {
            uuid: ble_uuid(0xfff0),
            characteristics: vec![
                GattCharacteristic {
                    uuid: ble_uuid(0xfff1),
                    properties: CharacteristicProperties {
                        notify: true,
                        ..Default::default()
                    },
                },
                GattCharacteristic {
                    uuid: ble_uuid(0xfff2),
                    properties: CharacteristicProperties {
                        write: true,
                        write_without_response: true,
                        ..Default::default()
                    },
                },
            ],
        }
    }

    pub fn generic_access_service() -> GattService {
        GattService {
            uuid: ble_uuid(0x1800),
            characteristics: vec![GattCharacteristic {
                uuid: ble_uuid(0x2a00),
                properties: CharacteristicProperties::default(),
            }],
        }
    }

    pub fn emit(&self, event: HardwareEvent) {
        let _ = self.events.send(event);
    }

    pub fn advertise(&self, name: Option<&str>, address: &str, rssi: i16) {
        self.emit(HardwareEvent::Advertisement {
            name: name.map(str::to_string),
            address: address.to_string(),
            rssi,
        });
    }

    pub fn script_connects(&self, outcomes: Vec<ConnectOutcome>) {
        self.state.lock().unwrap().connect_script = outcomes.into();
    }

    pub fn set_default_connect(&self, outcome: ConnectOutcome) {
        self.state.lock().unwrap().default_connect = outcome;
    }

    pub fn set_services(&self, services: Vec<GattService>) {
        self.state.lock().unwrap().services = services;
    }

    pub fn set_availability(&self, availability: Availability) {
        self.state.lock().unwrap().availability = availability;
    }

    pub fn respond(&self, command: &str, response: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(command.to_string(), response.to_string());
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().unwrap().fail_writes = fail;
    }

    pub fn fail_disconnects(&self, fail: bool) {
        self.state.lock().unwrap().fail_disconnects = fail;
    }

    pub fn connect_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().connect_calls.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().disconnect_calls.clone()
    }

    /// Commands written so far, without the trailing carriage return
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().unwrap().scan_starts
    }

    pub fn scan_stops(&self) -> usize {
        self.state.lock().unwrap().scan_stops
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn availability(&self) -> Availability {
        self.state.lock().unwrap().availability
    }

    async fn start_scan(&self) -> Result<()> {
        self.state.lock().unwrap().scan_starts += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.lock().unwrap().scan_stops += 1;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.connect_calls.push(address.to_string());
            let fallback = state.default_connect.clone();
            state.connect_script.pop_front().unwrap_or(fallback)
        };

        match outcome {
            ConnectOutcome::Succeed => self.emit(HardwareEvent::Connected {
                address: address.to_string(),
            }),
            ConnectOutcome::DropLink(reason) => self.emit(HardwareEvent::Disconnected {
                address: address.to_string(),
                reason,
            }),
            ConnectOutcome::Reject(reason) => bail!(reason),
            ConnectOutcome::Silent => {}
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.disconnect_calls.push(address.to_string());
        if state.fail_disconnects {
            bail!("device busy");
        }
        Ok(())
    }

    async fn discover_services(&self, _address: &str) -> Result<Vec<GattService>> {
        Ok(self.state.lock().unwrap().services.clone())
    }

    async fn subscribe(&self, _address: &str, characteristic: &CharacteristicRef) -> Result<()> {
        self.state.lock().unwrap().subscribed = Some(*characteristic);
        Ok(())
    }

    async fn write(
        &self,
        _address: &str,
        _characteristic: &CharacteristicRef,
        data: Bytes,
    ) -> Result<()> {
        let (reply, notify) = {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes {
                bail!("write rejected");
            }
            let command = String::from_utf8_lossy(&data).trim_end().to_string();
            state.writes.push(command.clone());
            (state.responses.get(&command).cloned(), state.subscribed)
        };

        // Deliver the reply in two chunks, the way small-MTU adapters do
        if let (Some(reply), Some(characteristic)) = (reply, notify) {
            let mut bytes = reply.into_bytes();
            bytes.extend_from_slice(b"\r\r>");
            let tail = bytes.split_off(bytes.len() / 2);
            for value in [bytes, tail] {
                self.emit(HardwareEvent::Notification {
                    characteristic,
                    value,
                });
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
