//! Simulated devices for testing
//!
//! [`MockSerialConnector`] speaks the loader protocol for devices attached
//! to named ports. [`MockOtaTransport`] answers uploads per address.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prov_core::{
    ChipVariant, DeviceIdentity, OtaTransport, ResolvedDevice, SerialConnector, SerialLink,
    TransportError,
};
use sha2::{Digest, Sha256};

use crate::config::MockConnectorConfig;
use crate::protocol::{
    identify_response, FlashHeader, CMD_FLASH, CMD_IDENTIFY, CMD_READ_LICENSE, FLASH_HEADER_LEN,
};

/// A simulated device attached to a serial port
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub device: ResolvedDevice,
    /// License the device reports as installed
    pub installed_license: Option<Vec<u8>>,
    /// Number of upcoming flashes answered with a wrong checksum
    pub corrupt_flashes: u32,
    /// Refuse every session
    pub fail_open: bool,
}

impl MockDevice {
    pub fn new(identity: DeviceIdentity, chip: ChipVariant) -> Self {
        Self {
            device: ResolvedDevice { identity, chip },
            installed_license: None,
            corrupt_flashes: 0,
            fail_open: false,
        }
    }

    pub fn with_installed_license(mut self, license: impl Into<Vec<u8>>) -> Self {
        self.installed_license = Some(license.into());
        self
    }

    pub fn with_corrupt_flashes(mut self, count: u32) -> Self {
        self.corrupt_flashes = count;
        self
    }

    pub fn with_fail_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

/// An image the simulated device accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashedImage {
    pub base_offset: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    devices: BTreeMap<String, MockDevice>,
    flashed: HashMap<String, Vec<FlashedImage>>,
    opens: HashMap<String, u32>,
}

/// Connector whose ports lead to simulated devices
#[derive(Debug, Clone, Default)]
pub struct MockSerialConnector {
    state: Arc<Mutex<MockState>>,
}

impl MockSerialConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// One ESP32-C5 per configured port, with identities numbered by position
    pub fn from_config(config: &MockConnectorConfig) -> Self {
        let connector = Self::new();
        for (idx, port) in config.ports.iter().enumerate() {
            let identity = DeviceIdentity::new([0x02, 0x00, 0x00, 0x00, 0x00, (idx as u8).wrapping_add(1)]);
            connector.attach(port, MockDevice::new(identity, ChipVariant::Esp32C5));
        }
        connector
    }

    pub fn attach(&self, port: &str, device: MockDevice) {
        self.state.lock().devices.insert(port.to_string(), device);
    }

    pub fn detach(&self, port: &str) {
        self.state.lock().devices.remove(port);
    }

    pub fn device(&self, port: &str) -> Option<MockDevice> {
        self.state.lock().devices.get(port).cloned()
    }

    /// Images the device on `port` accepted, oldest first
    pub fn flashed(&self, port: &str) -> Vec<FlashedImage> {
        self.state.lock().flashed.get(port).cloned().unwrap_or_default()
    }

    /// Sessions opened on `port`
    pub fn open_count(&self, port: &str) -> u32 {
        self.state.lock().opens.get(port).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SerialConnector for MockSerialConnector {
    async fn open(&self, port: &str, _baud_rate: u32) -> Result<Box<dyn SerialLink>, TransportError> {
        let mut state = self.state.lock();
        *state.opens.entry(port.to_string()).or_default() += 1;
        match state.devices.get(port) {
            None => Err(TransportError::ConnectionFailed(format!("no device on {}", port))),
            Some(device) if device.fail_open => {
                Err(TransportError::ConnectionFailed(format!("{} refused the session", port)))
            }
            Some(_) => Ok(Box::new(MockLink {
                port: port.to_string(),
                state: self.state.clone(),
                tx: Vec::new(),
                rx: VecDeque::new(),
            })),
        }
    }

    async fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.state.lock().devices.keys().cloned().collect())
    }
}

struct MockLink {
    port: String,
    state: Arc<Mutex<MockState>>,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
}

impl MockLink {
    /// Answer every complete command waiting in `tx`
    fn process(&mut self) -> Result<(), TransportError> {
        loop {
            let Some(&cmd) = self.tx.first() else {
                return Ok(());
            };
            let mut state = self.state.lock();
            let Some(device) = state.devices.get_mut(&self.port) else {
                return Err(TransportError::ConnectionClosed);
            };
            match cmd {
                CMD_IDENTIFY => {
                    self.rx.extend(identify_response(&device.device));
                    self.tx.drain(..1);
                }
                CMD_READ_LICENSE => {
                    let license = device.installed_license.clone().unwrap_or_default();
                    self.rx.extend((license.len() as u32).to_le_bytes());
                    self.rx.extend(license);
                    self.tx.drain(..1);
                }
                CMD_FLASH => {
                    if self.tx.len() < FLASH_HEADER_LEN {
                        return Ok(());
                    }
                    let header = FlashHeader::from_bytes(&self.tx)?;
                    let total = FLASH_HEADER_LEN + header.length as usize;
                    if self.tx.len() < total {
                        return Ok(());
                    }
                    let data: Vec<u8> = self.tx.drain(..total).skip(FLASH_HEADER_LEN).collect();
                    let mut digest: [u8; 32] = Sha256::digest(&data).into();
                    if device.corrupt_flashes > 0 {
                        device.corrupt_flashes -= 1;
                        digest[0] ^= 0xFF;
                    } else {
                        state
                            .flashed
                            .entry(self.port.clone())
                            .or_default()
                            .push(FlashedImage {
                                base_offset: header.base_offset,
                                data,
                            });
                    }
                    self.rx.extend(digest);
                }
                other => {
                    return Err(TransportError::ProtocolError(format!(
                        "unknown command 0x{:02x}",
                        other
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl SerialLink for MockLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.tx.extend_from_slice(data);
        self.process()
    }

    async fn read_exact(&mut self, len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if self.rx.len() < len {
            return Err(TransportError::Timeout(format!(
                "{} of {} bytes available",
                self.rx.len(),
                len
            )));
        }
        Ok(self.rx.drain(..len).collect())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx.clear();
        self.rx.clear();
        Ok(())
    }
}

/// How a simulated network device answers uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaBehavior {
    Accept,
    Status(u16),
    Unreachable,
    /// Never answers
    Hang,
    /// Accepts after the given number of milliseconds
    Slow(u64),
}

/// An upload the simulated network saw
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub address: IpAddr,
    pub path: String,
    pub len: usize,
}

/// OTA transport with per-address scripted answers
///
/// Addresses without a behavior are unreachable.
#[derive(Debug, Clone, Default)]
pub struct MockOtaTransport {
    behaviors: Arc<Mutex<HashMap<IpAddr, OtaBehavior>>>,
    uploads: Arc<Mutex<Vec<RecordedUpload>>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

/// Counts an upload as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockOtaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, address: IpAddr, behavior: OtaBehavior) {
        self.behaviors.lock().insert(address, behavior);
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }

    /// Most uploads that were in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn uploads_to(&self, address: IpAddr) -> Vec<RecordedUpload> {
        self.uploads
            .lock()
            .iter()
            .filter(|u| u.address == address)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl OtaTransport for MockOtaTransport {
    async fn upload(&self, address: IpAddr, path: &str, payload: Bytes) -> Result<u16, TransportError> {
        let behavior = self
            .behaviors
            .lock()
            .get(&address)
            .copied()
            .unwrap_or(OtaBehavior::Unreachable);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        match behavior {
            OtaBehavior::Unreachable => {
                Err(TransportError::ConnectionFailed(format!("{} is unreachable", address)))
            }
            OtaBehavior::Hang => {
                futures::future::pending::<()>().await;
                Err(TransportError::Timeout(address.to_string()))
            }
            OtaBehavior::Accept | OtaBehavior::Status(_) | OtaBehavior::Slow(_) => {
                if let OtaBehavior::Slow(ms) = behavior {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                self.uploads.lock().push(RecordedUpload {
                    address,
                    path: path.to_string(),
                    len: payload.len(),
                });
                Ok(match behavior {
                    OtaBehavior::Status(status) => status,
                    _ => 200,
                })
            }
        }
    }
}
