//! Bluetooth device and advertisement records.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use futures::future::BoxFuture;
use uuid::Uuid;

use crate::{scanner::Scanner, Address, AddressType, Result};

/// RSSI sentinel used when a source did not report signal strength.
pub const NO_RSSI_VALUE: i16 = -127;

/// Slot-pressure penalty applied per dB of RSSI advantage when a scanner is
/// down to its last free connection slot.
pub(crate) const SLOT_PRESSURE_PENALTY: f64 = 0.76;

/// A Bluetooth LE device as seen by a scanner.
///
/// This is the opaque handle passed to connection backends. The `source`
/// field is set for devices delivered by a remote proxy and absent for
/// devices seen by a locally attached radio.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BleDevice {
    /// Device address.
    pub address: Address,
    /// Device name, if advertised.
    pub name: Option<String>,
    /// Address type as reported on the wire.
    pub address_type: AddressType,
    /// Scanner source this device was delivered by, for proxy devices.
    pub source: Option<String>,
}

impl BleDevice {
    /// Creates a device handle for a locally attached radio.
    pub fn local(address: Address, name: Option<String>, address_type: AddressType) -> Self {
        Self { address, name, address_type, source: None }
    }

    /// Creates a device handle delivered by a remote proxy.
    pub fn remote(address: Address, name: Option<String>, source: impl Into<String>) -> Self {
        Self { address, name, address_type: AddressType::LePublic, source: Some(source.into()) }
    }
}

impl fmt::Display for BleDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", &self.address, name),
            None => write!(f, "{}", &self.address),
        }
    }
}

/// Parsed advertisement fields for a device as currently merged by a scanner.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementData {
    /// Local name from the advertisement or scan response.
    pub local_name: Option<String>,
    /// Manufacturer specific data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service class UUIDs.
    pub service_uuids: HashSet<Uuid>,
    /// Transmit power level, [NO_RSSI_VALUE] when absent.
    pub tx_power: i16,
    /// Received signal strength.
    pub rssi: i16,
}

/// The canonical advertisement record emitted to the central manager.
///
/// Immutable once emitted; the manager retains at most two per-address copies
/// (all history and connectable history).
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceInfo {
    /// Device address.
    pub address: Address,
    /// Device name, if known.
    pub name: Option<String>,
    /// Received signal strength.
    pub rssi: i16,
    /// Transmit power level, [NO_RSSI_VALUE] when absent.
    pub tx_power: i16,
    /// Manufacturer specific data keyed by company id.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service class UUIDs.
    pub service_uuids: HashSet<Uuid>,
    /// Source scanner id.
    pub source: String,
    /// Device handle the connection backend understands.
    pub device: BleDevice,
    /// Whether a connection can be opened over the delivering path.
    pub connectable: bool,
    /// Monotonic reception time in seconds.
    pub time: f64,
    /// Full advertisement PDU, when the source provides it.
    pub raw: Option<Vec<u8>>,
}

impl ServiceInfo {
    /// Builds the record a scanner emits for a merged advertisement.
    pub(crate) fn from_merged(
        source: &str, device: &BleDevice, adv: &AdvertisementData, connectable: bool, time: f64,
        raw: Option<Vec<u8>>,
    ) -> Self {
        Self {
            address: device.address,
            name: adv.local_name.clone().or_else(|| device.name.clone()),
            rssi: adv.rssi,
            tx_power: adv.tx_power,
            manufacturer_data: adv.manufacturer_data.clone(),
            service_data: adv.service_data.clone(),
            service_uuids: adv.service_uuids.clone(),
            source: source.to_string(),
            device: device.clone(),
            connectable,
            time,
            raw,
        }
    }

    /// Same-content copy with the connectable flag raised.
    ///
    /// Emitted when a non-connectable sighting has a connectable incumbent so
    /// clients can still obtain a connection via the other path.
    pub(crate) fn as_connectable(&self) -> Self {
        let mut info = self.clone();
        info.connectable = true;
        info
    }

    /// Advertisement fields of this record.
    pub fn advertisement(&self) -> AdvertisementData {
        AdvertisementData {
            local_name: self.name.clone(),
            manufacturer_data: self.manufacturer_data.clone(),
            service_data: self.service_data.clone(),
            service_uuids: self.service_uuids.clone(),
            tx_power: self.tx_power,
            rssi: self.rssi,
        }
    }
}

/// A backend performing the actual GATT connection for a device.
pub trait GattClient: Send {
    /// Connect to the device.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;
    /// Disconnect from the device.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;
    /// Whether the backend currently holds an open connection.
    fn is_connected(&self) -> bool;
}

/// Creates connection backends for devices reachable through a scanner.
pub trait ClientFactory: Send + Sync {
    /// Backend name for diagnostics.
    fn backend_name(&self) -> &str;
    /// Create a backend for the device.
    fn client(&self, device: &BleDevice) -> Box<dyn GattClient>;
}

/// How to connect devices delivered by a remote scanner.
#[derive(Clone, custom_debug::Debug)]
pub struct Connector {
    /// Source the connector belongs to.
    pub source: String,
    /// Whether the backend can accept another connection right now.
    #[debug(skip)]
    pub can_connect: Arc<dyn Fn() -> bool + Send + Sync>,
    /// Backend factory.
    #[debug(skip)]
    pub factory: Arc<dyn ClientFactory>,
}

/// A device together with the scanner that saw it and the advertisement the
/// scanner currently holds for it.
#[derive(Clone, Debug)]
pub struct ScannerDevice {
    /// The scanner that saw the device.
    pub scanner: Scanner,
    /// Device handle held by the scanner.
    pub device: BleDevice,
    /// Advertisement the scanner currently holds.
    pub advertisement: AdvertisementData,
}

impl ScannerDevice {
    /// Score this connection path.
    ///
    /// Base score is the advertisement RSSI. A scanner with no free
    /// connection slots scores [NO_RSSI_VALUE]; a scanner down to its last
    /// free slot is penalized by the RSSI margin over the runner-up so a
    /// nearly-as-good path with spare capacity wins.
    pub fn score_connection_path(&self, rssi_diff: i16) -> f64 {
        let rssi = f64::from(self.advertisement.rssi);
        match self.scanner.get_allocations() {
            Some(allocations) if allocations.free == 0 => f64::from(NO_RSSI_VALUE),
            Some(allocations) if allocations.free == 1 && rssi_diff > 0 => {
                rssi - f64::from(rssi_diff) * SLOT_PRESSURE_PENALTY
            }
            _ => rssi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{manager::SlotAllocations, scanner::RemoteScanner};

    fn path(rssi: i16, slots_free: Option<(usize, usize)>) -> ScannerDevice {
        let scanner = RemoteScanner::new(
            "proxy",
            "proxy",
            Arc::new(|_info: ServiceInfo| {}),
            None,
            true,
        )
        .as_scanner();
        if let Some((slots, free)) = slots_free {
            scanner.set_allocations(Some(SlotAllocations {
                source: "proxy".into(),
                slots,
                free,
                allocated: Vec::new(),
            }));
        }
        let device = BleDevice::remote(Address::any(), None, "proxy");
        let advertisement = AdvertisementData { rssi, ..Default::default() };
        ScannerDevice { scanner, device, advertisement }
    }

    #[test]
    fn slot_pressure_scoring() {
        // No slot accounting or spare capacity: plain RSSI.
        assert_eq!(path(-60, None).score_connection_path(5), -60.0);
        assert_eq!(path(-60, Some((3, 2))).score_connection_path(5), -60.0);
        // Last free slot: penalized by the margin over the runner-up.
        assert!((path(-60, Some((3, 1))).score_connection_path(5) - (-63.8)).abs() < 1e-9);
        assert_eq!(path(-60, Some((3, 1))).score_connection_path(0), -60.0);
        // No free slots: effectively excluded.
        assert_eq!(path(-60, Some((3, 0))).score_connection_path(5), f64::from(NO_RSSI_VALUE));
    }

    #[test]
    fn surfaced_copy_only_toggles_connectable() {
        let device = BleDevice::remote(Address::any(), Some("dev".into()), "proxy");
        let info = ServiceInfo::from_merged(
            "proxy",
            &device,
            &AdvertisementData { rssi: -60, ..Default::default() },
            false,
            1.0,
            None,
        );
        let surfaced = info.as_connectable();
        assert!(surfaced.connectable);
        assert_eq!(surfaced.address, info.address);
        assert_eq!(surfaced.rssi, info.rssi);
        assert_eq!(surfaced.name, info.name);
        assert_eq!(surfaced.time, info.time);
    }
}
