//! Local adapter scanner.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::future::BoxFuture;
use num_traits::FromPrimitive;
use uuid::Uuid;

use crate::{
    adapters::AdapterRecovery,
    monotonic_time,
    scanner::{unsetup_handle, AdvertisementSink, Scanner, ScannerCore, ScanningMode},
    Address, AddressType, CallbackHandle, Error, ErrorKind, Result,
};

/// Bluetooth base UUID that 16 and 32 bit assigned numbers expand into.
const BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

/// Expand a 16-bit assigned number into a full service UUID.
pub(crate) fn uuid_from_u16(v: u16) -> Uuid {
    uuid_from_u32(v.into())
}

/// Expand a 32-bit assigned number into a full service UUID.
pub(crate) fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BASE_UUID | (u128::from(v) << 96))
}

/// UUID from its little-endian wire representation.
fn uuid_from_le128(bytes: &[u8]) -> Uuid {
    let mut be = [0; 16];
    be.copy_from_slice(bytes);
    be.reverse();
    Uuid::from_bytes(be)
}

/// Common advertising data types.
///
/// See [the GATT specification](https://www.bluetooth.com/specifications/assigned-numbers/generic-access-profile/)
/// for a complete list.
mod data_type {
    /// Incomplete List of 16-bit Service Class UUIDs.
    pub const INCOMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS: u8 = 0x02;

    /// Complete List of 16-bit Service Class UUIDs.
    pub const COMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS: u8 = 0x03;

    /// Incomplete List of 32-bit Service Class UUIDs.
    pub const INCOMPLETE_LIST_32_BIT_SERVICE_CLASS_UUIDS: u8 = 0x04;

    /// Complete List of 32-bit Service Class UUIDs.
    pub const COMPLETE_LIST_32_BIT_SERVICE_CLASS_UUIDS: u8 = 0x05;

    /// Incomplete List of 128-bit Service Class UUIDs.
    pub const INCOMPLETE_LIST_128_BIT_SERVICE_CLASS_UUIDS: u8 = 0x06;

    /// Complete List of 128-bit Service Class UUIDs.
    pub const COMPLETE_LIST_128_BIT_SERVICE_CLASS_UUIDS: u8 = 0x07;

    /// Shortened Local Name.
    pub const SHORTENED_LOCAL_NAME: u8 = 0x08;

    /// Complete Local Name.
    pub const COMPLETE_LOCAL_NAME: u8 = 0x09;

    /// TX Power Level.
    pub const TX_POWER_LEVEL: u8 = 0x0A;

    /// Service Data - 16-bit UUID.
    pub const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;

    /// Service Data - 32-bit UUID.
    pub const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;

    /// Service Data - 128-bit UUID.
    pub const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;

    /// Manufacturer Specific Data.
    pub const MANUFACTURER_SPECIFIC_DATA: u8 = 0xFF;
}

/// Device found flag: the device does not accept connections.
const MGMT_DEV_FOUND_NOT_CONNECTABLE: u32 = 1 << 2;

/// Attempts to start scanning in the requested mode before giving up.
const START_ATTEMPTS: usize = 3;

/// Delay between scanning start attempts.
const START_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Starts and stops scanning on a local radio.
///
/// Implemented by the component that drives the adapter; the scanner itself
/// does not speak HCI beyond the MGMT ingress frames.
pub trait ScanControl: Send + Sync {
    /// Start scanning in the given mode.
    fn start_scanning(&self, mode: ScanningMode) -> BoxFuture<'_, Result<()>>;
    /// Stop scanning.
    fn stop_scanning(&self) -> BoxFuture<'_, Result<()>>;
}

/// Notification of a scanning mode transition.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannerModeChange {
    /// Source of the scanner whose mode changed.
    pub source: String,
    /// Mode that was requested.
    pub requested_mode: Option<ScanningMode>,
    /// Mode the scanner is now running in.
    pub current_mode: Option<ScanningMode>,
}

type ModeCallback = Arc<dyn Fn(ScannerModeChange) + Send + Sync>;

#[derive(Default)]
struct ModeState {
    requested: Option<ScanningMode>,
    current: Option<ScanningMode>,
    callbacks: HashMap<u64, ModeCallback>,
    next_callback_id: u64,
}

/// Scanner fronting a locally attached radio.
///
/// Raw advertisement frames arrive through the MGMT channel and are parsed
/// and merged here; the same record shape as a remote scanner's is emitted to
/// the manager.
#[derive(Clone)]
pub struct LocalScanner {
    inner: Arc<LocalScannerInner>,
}

struct LocalScannerInner {
    core: Arc<ScannerCore>,
    control: Option<Arc<dyn ScanControl>>,
    recovery: Option<Arc<dyn AdapterRecovery>>,
    adapter_address: Address,
    mode: Mutex<ModeState>,
}

impl LocalScanner {
    /// Creates a local scanner.
    ///
    /// `adapter_idx` is the MGMT controller index of the adapter; the MGMT
    /// channel dispatches raw frames for that index here.
    pub fn new(
        source: impl Into<String>, adapter: impl Into<String>, adapter_idx: u16,
        adapter_address: Address, sink: AdvertisementSink, control: Option<Arc<dyn ScanControl>>,
        recovery: Option<Arc<dyn AdapterRecovery>>,
    ) -> Self {
        Self {
            inner: Arc::new(LocalScannerInner {
                core: Arc::new(ScannerCore::new(
                    source,
                    adapter,
                    None,
                    true,
                    Some(adapter_idx),
                    sink,
                )),
                control,
                recovery,
                adapter_address,
                mode: Mutex::new(ModeState::default()),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<ScannerCore> {
        &self.inner.core
    }

    /// Wraps this scanner in the [Scanner] registry type.
    pub fn as_scanner(&self) -> Scanner {
        Scanner::Local(self.clone())
    }

    /// Start the watchdog.
    ///
    /// Dropping the returned handle stops it.
    pub fn setup(&self) -> CallbackHandle {
        self.inner.core.setup_watchdog();
        unsetup_handle(&self.inner.core)
    }

    /// Mode the scanner is currently running in.
    pub fn current_mode(&self) -> Option<ScanningMode> {
        self.inner.mode.lock().unwrap().current
    }

    /// Mode that was last requested.
    pub fn requested_mode(&self) -> Option<ScanningMode> {
        self.inner.mode.lock().unwrap().requested
    }

    /// Register a callback invoked on scanning mode transitions.
    pub fn register_mode_callback(
        &self, callback: impl Fn(ScannerModeChange) + Send + Sync + 'static,
    ) -> CallbackHandle {
        let mut mode = self.inner.mode.lock().unwrap();
        let id = mode.next_callback_id;
        mode.next_callback_id += 1;
        mode.callbacks.insert(id, Arc::new(callback));
        let inner = Arc::downgrade(&self.inner);
        CallbackHandle::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.mode.lock().unwrap().callbacks.remove(&id);
            }
        })
    }

    fn set_current_mode(&self, current: Option<ScanningMode>) {
        let (event, callbacks) = {
            let mut mode = self.inner.mode.lock().unwrap();
            mode.current = current;
            let event = ScannerModeChange {
                source: self.inner.core.source.clone(),
                requested_mode: mode.requested,
                current_mode: mode.current,
            };
            let callbacks: Vec<ModeCallback> = mode.callbacks.values().cloned().collect();
            (event, callbacks)
        };
        for callback in callbacks {
            callback(event.clone());
        }
    }

    /// Start scanning in the requested mode.
    ///
    /// A known adapter-initializing failure is retried a bounded number of
    /// times with the hardware recovery hook interleaved. When active mode
    /// keeps failing, the scanner falls back to passive and reports the
    /// transition through the mode callbacks.
    pub async fn start(&self, mode: ScanningMode) -> Result<()> {
        let Some(control) = self.inner.control.clone() else {
            return Err(Error::with_message(ErrorKind::Failed, "scanner has no scan control"));
        };
        self.inner.mode.lock().unwrap().requested = Some(mode);

        let mut mode = mode;
        loop {
            match self.try_start(&*control, mode).await {
                Ok(()) => {
                    self.set_current_mode(Some(mode));
                    return Ok(());
                }
                Err(err) if mode == ScanningMode::Active => {
                    log::warn!(
                        "{}: failed to start active scanning ({err}), falling back to passive",
                        self.inner.core.name
                    );
                    mode = ScanningMode::Passive;
                }
                Err(err) => {
                    self.set_current_mode(None);
                    return Err(err);
                }
            }
        }
    }

    async fn try_start(&self, control: &dyn ScanControl, mode: ScanningMode) -> Result<()> {
        let mut last_err = Error::new(ErrorKind::NotReady);
        for attempt in 1..=START_ATTEMPTS {
            match control.start_scanning(mode).await {
                Ok(()) => return Ok(()),
                Err(err) if err.kind == ErrorKind::NotReady => {
                    log::debug!(
                        "{}: adapter not ready starting {mode} scanning (attempt {attempt}/{}): {err}",
                        self.inner.core.name,
                        START_ATTEMPTS
                    );
                    last_err = err;
                    if let Some(recovery) = &self.inner.recovery {
                        if let Err(reset_err) = recovery
                            .reset_adapter(&self.inner.core.adapter, self.inner.adapter_address)
                            .await
                        {
                            log::debug!(
                                "{}: adapter reset failed: {reset_err}",
                                self.inner.core.name
                            );
                        }
                    }
                    tokio::time::sleep(START_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Stop scanning.
    pub async fn stop(&self) -> Result<()> {
        if let Some(control) = self.inner.control.clone() {
            control.stop_scanning().await?;
        }
        self.set_current_mode(None);
        Ok(())
    }

    /// Raw advertisement ingestion entry point used by the MGMT channel.
    ///
    /// `rssi` has already been converted to signed; `data` is the raw AD
    /// payload of the frame.
    pub fn on_raw_advertisement(
        &self, address: Address, address_type: u8, rssi: i16, flags: u32, data: &[u8],
    ) {
        let parsed = parse_advertisement(data);
        let connectable = flags & MGMT_DEV_FOUND_NOT_CONNECTABLE == 0;
        self.inner.core.on_advertisement(
            address,
            rssi,
            parsed.local_name,
            parsed.service_uuids,
            parsed.service_data,
            parsed.manufacturer_data,
            parsed.tx_power,
            AddressType::from_u8(address_type).unwrap_or_default(),
            connectable,
            Some(data.to_vec()),
            monotonic_time(),
        );
    }
}

#[derive(Debug, Default)]
struct ParsedAdvertisement {
    local_name: Option<String>,
    complete_name: bool,
    service_uuids: HashSet<Uuid>,
    service_data: HashMap<Uuid, Vec<u8>>,
    manufacturer_data: HashMap<u16, Vec<u8>>,
    tx_power: Option<i16>,
}

/// Parse the AD structures of a raw advertisement payload.
///
/// Malformed structures terminate the walk; everything parsed up to that
/// point is kept.
fn parse_advertisement(mut data: &[u8]) -> ParsedAdvertisement {
    use data_type::*;

    let mut parsed = ParsedAdvertisement::default();
    while let [len, rest @ ..] = data {
        let len = *len as usize;
        if len == 0 || rest.len() < len {
            break;
        }
        let (structure, remaining) = rest.split_at(len);
        data = remaining;
        let (ad_type, value) = (structure[0], &structure[1..]);
        match ad_type {
            SHORTENED_LOCAL_NAME if !parsed.complete_name => {
                parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
            }
            COMPLETE_LOCAL_NAME => {
                parsed.local_name = Some(String::from_utf8_lossy(value).into_owned());
                parsed.complete_name = true;
            }
            INCOMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS | COMPLETE_LIST_16_BIT_SERVICE_CLASS_UUIDS => {
                for uuid in value.chunks_exact(2) {
                    parsed
                        .service_uuids
                        .insert(uuid_from_u16(u16::from_le_bytes([uuid[0], uuid[1]])));
                }
            }
            INCOMPLETE_LIST_32_BIT_SERVICE_CLASS_UUIDS | COMPLETE_LIST_32_BIT_SERVICE_CLASS_UUIDS => {
                for uuid in value.chunks_exact(4) {
                    parsed.service_uuids.insert(uuid_from_u32(u32::from_le_bytes([
                        uuid[0], uuid[1], uuid[2], uuid[3],
                    ])));
                }
            }
            INCOMPLETE_LIST_128_BIT_SERVICE_CLASS_UUIDS
            | COMPLETE_LIST_128_BIT_SERVICE_CLASS_UUIDS => {
                for uuid in value.chunks_exact(16) {
                    parsed.service_uuids.insert(uuid_from_le128(uuid));
                }
            }
            TX_POWER_LEVEL => {
                if let [tx_power] = value {
                    parsed.tx_power = Some(i16::from(*tx_power as i8));
                }
            }
            SERVICE_DATA_16_BIT_UUID if value.len() >= 2 => {
                let uuid = uuid_from_u16(u16::from_le_bytes([value[0], value[1]]));
                parsed.service_data.insert(uuid, value[2..].to_vec());
            }
            SERVICE_DATA_32_BIT_UUID if value.len() >= 4 => {
                let uuid =
                    uuid_from_u32(u32::from_le_bytes([value[0], value[1], value[2], value[3]]));
                parsed.service_data.insert(uuid, value[4..].to_vec());
            }
            SERVICE_DATA_128_BIT_UUID if value.len() >= 16 => {
                parsed.service_data.insert(uuid_from_le128(&value[..16]), value[16..].to_vec());
            }
            MANUFACTURER_SPECIFIC_DATA if value.len() >= 2 => {
                let company = u16::from_le_bytes([value[0], value[1]]);
                parsed.manufacturer_data.insert(company, value[2..].to_vec());
            }
            _ => {}
        }
    }
    parsed
}
