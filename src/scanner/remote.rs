//! Remote proxy scanner.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
    time::Duration,
};

use uuid::Uuid;

use crate::{
    device::Connector,
    manager::CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS,
    monotonic_time,
    scanner::{unsetup_handle, AdvertisementSink, Scanner, ScannerCore},
    Address, AddressType, CallbackHandle,
};

/// Interval between expiration sweeps over the per-address cache.
const EXPIRE_DEVICES_INTERVAL: Duration = Duration::from_secs(30);

/// Scanner fed with pre-parsed advertisements by a remote proxy.
///
/// Fields of progressively arriving advertisements are merged per address so
/// the cache always holds the most complete view a source has of a device.
/// Devices not seen for the stale-advertisement horizon are expired here even
/// when they are not connectable; the manager separately decides
/// availability.
#[derive(Clone)]
pub struct RemoteScanner {
    core: Arc<ScannerCore>,
    expire_seconds: f64,
}

impl RemoteScanner {
    /// Creates a remote scanner.
    ///
    /// `sink` receives one merged record per inbound advertisement; wire it
    /// to [Manager::advertisement_sink](crate::Manager::advertisement_sink).
    pub fn new(
        scanner_id: impl Into<String>, name: impl Into<String>, sink: AdvertisementSink,
        connector: Option<Connector>, connectable: bool,
    ) -> Self {
        Self {
            core: Arc::new(ScannerCore::new(scanner_id, name, connector, connectable, None, sink)),
            expire_seconds: CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS,
        }
    }

    pub(crate) fn core(&self) -> &Arc<ScannerCore> {
        &self.core
    }

    /// Wraps this scanner in the [Scanner] registry type.
    pub fn as_scanner(&self) -> Scanner {
        Scanner::Remote(self.clone())
    }

    /// Start the watchdog and the expiration sweep.
    ///
    /// Dropping the returned handle stops both.
    pub fn setup(&self) -> CallbackHandle {
        self.core.setup_watchdog();
        let core = Arc::downgrade(&self.core);
        let expire_seconds = self.expire_seconds;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXPIRE_DEVICES_INTERVAL).await;
                let Some(core) = Weak::upgrade(&core) else { break };
                Self::expire_devices(&core, expire_seconds);
            }
        });
        self.core.state.lock().unwrap().tasks.push(task);
        unsetup_handle(&self.core)
    }

    fn expire_devices(core: &ScannerCore, expire_seconds: f64) {
        let now = monotonic_time();
        let mut state = core.state.lock().unwrap();
        let expired: Vec<Address> = state
            .timestamps
            .iter()
            .filter(|(_, timestamp)| now - **timestamp > expire_seconds)
            .map(|(address, _)| *address)
            .collect();
        for address in expired {
            log::debug!("{}: Expiring {address}", core.name);
            state.devices.remove(&address);
            state.timestamps.remove(&address);
        }
    }

    /// Ingest one pre-parsed advertisement from the proxy.
    #[allow(clippy::too_many_arguments)]
    pub fn on_advertisement(
        &self, address: Address, rssi: i16, local_name: Option<String>,
        service_uuids: HashSet<Uuid>, service_data: HashMap<Uuid, Vec<u8>>,
        manufacturer_data: HashMap<u16, Vec<u8>>, tx_power: Option<i16>,
        advertisement_monotonic_time: f64,
    ) {
        self.core.on_advertisement(
            address,
            rssi,
            local_name,
            service_uuids,
            service_data,
            manufacturer_data,
            tx_power,
            AddressType::LePublic,
            self.core.connectable,
            None,
            advertisement_monotonic_time,
        );
    }
}
