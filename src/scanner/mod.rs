//! Advertisement scanners.
//!
//! A scanner is a logical origin of advertisements identified by a stable
//! source string, usually the MAC address of the radio. [Remote
//! scanners](remote::RemoteScanner) ingest pre-parsed advertisements from a
//! proxy; [local scanners](local::LocalScanner) ingest raw frames delivered by
//! the [MGMT channel](crate::mgmt::MgmtChannel).

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use strum::{Display, EnumString};
use tokio::task::JoinHandle;

use crate::{
    device::{AdvertisementData, BleDevice, Connector, ServiceInfo, NO_RSSI_VALUE},
    manager::SlotAllocations,
    monotonic_time, Address, AddressType, CallbackHandle,
};

pub mod local;
pub mod remote;

pub use local::LocalScanner;
pub use remote::RemoteScanner;

/// Interval between scanner watchdog checks.
pub const SCANNER_WATCHDOG_INTERVAL: Duration = Duration::from_secs(300);

/// Quiet period after which the watchdog marks a scanner as not scanning.
pub const SCANNER_WATCHDOG_TIMEOUT: f64 = 900.0;

/// Scanning mode of a local radio.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ScanningMode {
    /// Active scanning with scan requests.
    #[strum(serialize = "active")]
    Active,
    /// Passive listening.
    #[strum(serialize = "passive")]
    Passive,
}

/// Receiver for advertisement records emitted by scanners.
pub type AdvertisementSink = Arc<dyn Fn(ServiceInfo) + Send + Sync>;

/// Hook invoked when a scanner pauses listening to establish a connection.
pub(crate) type PauseHook = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ScannerCore {
    pub source: String,
    pub adapter: String,
    pub name: String,
    pub connector: Option<Connector>,
    pub connectable: bool,
    pub adapter_idx: Option<u16>,
    pub sink: AdvertisementSink,
    pub state: Mutex<CoreState>,
}

#[derive(Default)]
pub(crate) struct CoreState {
    pub scanning: bool,
    pub start_time: f64,
    pub last_detection: f64,
    pub connecting: usize,
    pub in_progress: HashSet<Address>,
    pub failures: HashMap<Address, usize>,
    pub devices: HashMap<Address, (BleDevice, AdvertisementData)>,
    pub timestamps: HashMap<Address, f64>,
    pub allocations: Option<SlotAllocations>,
    pub pause_hook: Option<PauseHook>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl ScannerCore {
    pub fn new(
        source: impl Into<String>, adapter: impl Into<String>, connector: Option<Connector>,
        connectable: bool, adapter_idx: Option<u16>, sink: AdvertisementSink,
    ) -> Self {
        let source = source.into();
        let adapter = adapter.into();
        let name =
            if adapter == source { source.clone() } else { format!("{adapter} ({source})") };
        Self {
            source,
            adapter,
            name,
            connector,
            connectable,
            adapter_idx,
            sink,
            state: Mutex::new(CoreState { scanning: true, ..CoreState::default() }),
        }
    }

    /// Start the watchdog; called from each variant's setup.
    pub fn setup_watchdog(self: &Arc<Self>) {
        let now = monotonic_time();
        let mut state = self.state.lock().unwrap();
        state.start_time = now;
        state.last_detection = now;
        let core = Arc::downgrade(self);
        state.tasks.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(SCANNER_WATCHDOG_INTERVAL).await;
                let Some(core) = Weak::upgrade(&core) else { break };
                core.watchdog_tick();
            }
        }));
    }

    fn watchdog_tick(&self) {
        let time_since_last_detection = monotonic_time() - self.state.lock().unwrap().last_detection;
        log::debug!(
            "{}: Scanner watchdog time_since_last_detection: {}",
            self.name,
            time_since_last_detection
        );
        let mut state = self.state.lock().unwrap();
        if time_since_last_detection > SCANNER_WATCHDOG_TIMEOUT {
            log::info!(
                "{}: Bluetooth scanner has gone quiet for {}s, check the scanner device for more information",
                self.name,
                SCANNER_WATCHDOG_TIMEOUT
            );
            state.scanning = false;
            return;
        }
        state.scanning = state.connecting == 0;
    }

    /// Stop all spawned tasks.
    pub fn unsetup(&self) {
        let tasks = {
            let mut state = self.state.lock().unwrap();
            std::mem::take(&mut state.tasks)
        };
        for task in tasks {
            task.abort();
        }
    }

    /// Merge an inbound advertisement into the per-address cache and emit the
    /// resulting record.
    ///
    /// This path is synchronous; the sink is invoked after the scanner state
    /// lock has been released.
    #[allow(clippy::too_many_arguments)]
    pub fn on_advertisement(
        &self, address: Address, rssi: i16, local_name: Option<String>,
        mut service_uuids: HashSet<uuid::Uuid>, mut service_data: HashMap<uuid::Uuid, Vec<u8>>,
        mut manufacturer_data: HashMap<u16, Vec<u8>>, tx_power: Option<i16>,
        address_type: AddressType, connectable: bool, raw: Option<Vec<u8>>, time: f64,
    ) {
        let mut local_name = local_name.filter(|name| !name.is_empty());
        let info = {
            let mut state = self.state.lock().unwrap();
            state.scanning = state.connecting == 0;
            state.last_detection = time;

            let device = match state.devices.get(&address) {
                None => BleDevice {
                    address,
                    name: local_name.clone(),
                    address_type,
                    source: self.connector.is_some().then(|| self.source.clone()),
                },
                Some((prev_device, prev_adv)) => {
                    // Merge the new data with the old data so progressively
                    // arriving fields accumulate per address.
                    if let Some(prev_name) = &prev_device.name {
                        match &local_name {
                            Some(name) if name.len() >= prev_name.len() => {}
                            _ => local_name = Some(prev_name.clone()),
                        }
                    }

                    if service_uuids.is_empty() {
                        service_uuids = prev_adv.service_uuids.clone();
                    } else if service_uuids != prev_adv.service_uuids {
                        service_uuids.extend(prev_adv.service_uuids.iter().copied());
                    }

                    if service_data.is_empty() {
                        service_data = prev_adv.service_data.clone();
                    } else if service_data != prev_adv.service_data {
                        let mut merged = prev_adv.service_data.clone();
                        merged.extend(service_data);
                        service_data = merged;
                    }

                    if manufacturer_data.is_empty() {
                        manufacturer_data = prev_adv.manufacturer_data.clone();
                    } else if manufacturer_data != prev_adv.manufacturer_data {
                        let mut merged = prev_adv.manufacturer_data.clone();
                        merged.extend(manufacturer_data);
                        manufacturer_data = merged;
                    }

                    let mut device = prev_device.clone();
                    device.name = local_name.clone();
                    device.address_type = address_type;
                    device
                }
            };

            let advertisement = AdvertisementData {
                local_name: local_name.clone(),
                manufacturer_data,
                service_data,
                service_uuids,
                tx_power: tx_power.unwrap_or(NO_RSSI_VALUE),
                rssi,
            };
            let info = ServiceInfo::from_merged(
                &self.source,
                &device,
                &advertisement,
                connectable,
                time,
                raw,
            );
            state.devices.insert(address, (device, advertisement));
            state.timestamps.insert(address, time);
            info
        };
        (self.sink)(info);
    }

    pub fn add_connecting(&self, address: Address) {
        let pause_hook = {
            let mut state = self.state.lock().unwrap();
            state.connecting += 1;
            state.scanning = false;
            state.in_progress.insert(address);
            // Only a local radio stops listening while it connects.
            if self.adapter_idx.is_some() {
                state.pause_hook.clone()
            } else {
                None
            }
        };
        if let Some(pause_hook) = pause_hook {
            pause_hook(&self.source);
        }
    }

    pub fn finished_connecting(&self, address: Address, success: bool) {
        let mut state = self.state.lock().unwrap();
        state.connecting = state.connecting.saturating_sub(1);
        state.scanning = state.connecting == 0;
        state.in_progress.remove(&address);
        if success {
            state.failures.remove(&address);
        } else {
            let failures = state.failures.entry(address).or_default();
            *failures += 1;
            log::debug!("{}: connection failure #{} for {}", self.name, failures, address);
        }
    }

    pub fn clear_connection_history(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_progress.clear();
        state.failures.clear();
    }
}

/// Tracks connecting state of a scanner.
///
/// While held, the scanner reports itself as not scanning; releasing the
/// guard restores `scanning` when no other connection attempt is in flight.
/// The guard runs on every exit path, including errors.
#[must_use = "the scanner counts as connecting only while the guard is held"]
pub struct ConnectingGuard {
    core: Arc<ScannerCore>,
}

impl Drop for ConnectingGuard {
    fn drop(&mut self) {
        let mut state = self.core.state.lock().unwrap();
        state.connecting = state.connecting.saturating_sub(1);
        state.scanning = state.connecting == 0;
    }
}

/// A registered advertisement source.
///
/// Remote scanners deliver pre-parsed advertisements from a proxy; local
/// scanners front a locally attached radio fed by the MGMT channel.
#[derive(Clone)]
pub enum Scanner {
    /// Scanner fed by a remote proxy.
    Remote(RemoteScanner),
    /// Scanner fronting a locally attached radio.
    Local(LocalScanner),
}

impl Scanner {
    pub(crate) fn core(&self) -> &Arc<ScannerCore> {
        match self {
            Self::Remote(scanner) => scanner.core(),
            Self::Local(scanner) => scanner.core(),
        }
    }

    /// Unique source id of the scanner.
    pub fn source(&self) -> &str {
        &self.core().source
    }

    /// Adapter the scanner runs on.
    pub fn adapter(&self) -> &str {
        &self.core().adapter
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.core().name
    }

    /// Whether connections can be routed over this scanner.
    pub fn connectable(&self) -> bool {
        self.core().connectable
    }

    /// Connector for proxy-delivered devices.
    pub fn connector(&self) -> Option<&Connector> {
        self.core().connector.as_ref()
    }

    /// MGMT controller index, present only for local adapters.
    pub fn adapter_idx(&self) -> Option<u16> {
        self.core().adapter_idx
    }

    /// Whether the scanner is currently scanning.
    pub fn scanning(&self) -> bool {
        self.core().state.lock().unwrap().scanning
    }

    /// Current scanning mode, if the scanner is a local radio.
    pub fn current_mode(&self) -> Option<ScanningMode> {
        match self {
            Self::Remote(_) => None,
            Self::Local(scanner) => scanner.current_mode(),
        }
    }

    /// Addresses the scanner currently holds advertisements for.
    pub fn discovered_addresses(&self) -> Vec<Address> {
        self.core().state.lock().unwrap().devices.keys().copied().collect()
    }

    /// Devices the scanner currently holds advertisements for.
    pub fn discovered_devices(&self) -> Vec<BleDevice> {
        self.core().state.lock().unwrap().devices.values().map(|(device, _)| device.clone()).collect()
    }

    /// Device and advertisement for an address, if the scanner has seen it.
    pub fn get_discovered_device_advertisement_data(
        &self, address: &Address,
    ) -> Option<(BleDevice, AdvertisementData)> {
        self.core().state.lock().unwrap().devices.get(address).cloned()
    }

    /// Number of connection attempts currently in flight.
    pub fn connections_in_progress(&self) -> usize {
        self.core().state.lock().unwrap().connecting
    }

    /// Number of recent connection failures for the address.
    pub fn connection_failures(&self, address: &Address) -> usize {
        self.core().state.lock().unwrap().failures.get(address).copied().unwrap_or(0)
    }

    /// Slot allocations of the adapter this scanner runs on, if slot limited.
    pub fn get_allocations(&self) -> Option<SlotAllocations> {
        self.core().state.lock().unwrap().allocations.clone()
    }

    /// Mark a connection attempt to the address as started.
    pub fn add_connecting(&self, address: Address) {
        self.core().add_connecting(address);
    }

    /// Mark a connection attempt to the address as finished.
    pub fn finished_connecting(&self, address: Address, success: bool) {
        self.core().finished_connecting(address, success);
    }

    /// Guard that tracks connecting state for the duration of a scope.
    pub fn connecting(&self) -> ConnectingGuard {
        let core = self.core().clone();
        {
            let mut state = core.state.lock().unwrap();
            state.connecting += 1;
            state.scanning = false;
        }
        ConnectingGuard { core }
    }

    pub(crate) fn set_allocations(&self, allocations: Option<SlotAllocations>) {
        self.core().state.lock().unwrap().allocations = allocations;
    }

    pub(crate) fn set_pause_hook(&self, pause_hook: Option<PauseHook>) {
        self.core().state.lock().unwrap().pause_hook = pause_hook;
    }

    pub(crate) fn clear_connection_history(&self) {
        self.core().clear_connection_history();
    }

    /// Diagnostic snapshot.
    pub fn diagnostics(&self) -> ScannerDiagnostics {
        let core = self.core();
        let now = monotonic_time();
        let state = core.state.lock().unwrap();
        ScannerDiagnostics {
            name: core.name.clone(),
            source: core.source.clone(),
            adapter: core.adapter.clone(),
            connectable: core.connectable,
            scanning: state.scanning,
            start_time: state.start_time,
            last_detection: state.last_detection,
            monotonic_time: now,
            current_mode: self.current_mode(),
            discovered_devices: state
                .devices
                .values()
                .map(|(device, advertisement)| DiscoveredDeviceDiagnostics {
                    address: device.address,
                    name: device.name.clone(),
                    rssi: advertisement.rssi,
                    manufacturer_data: advertisement
                        .manufacturer_data
                        .iter()
                        .map(|(company, data)| (*company, hex::encode(data)))
                        .collect(),
                    time_since_detection: state
                        .timestamps
                        .get(&device.address)
                        .map(|timestamp| now - timestamp),
                })
                .collect(),
        }
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let kind = match self {
            Self::Remote(_) => "Remote",
            Self::Local(_) => "Local",
        };
        f.debug_struct("Scanner").field("kind", &kind).field("name", &self.name()).finish()
    }
}

/// Snapshot of a scanner's state.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScannerDiagnostics {
    /// Human readable name.
    pub name: String,
    /// Source id.
    pub source: String,
    /// Adapter name.
    pub adapter: String,
    /// Whether connections can be routed over this scanner.
    pub connectable: bool,
    /// Whether the scanner is currently scanning.
    pub scanning: bool,
    /// Monotonic setup time.
    pub start_time: f64,
    /// Monotonic time of the last received advertisement.
    pub last_detection: f64,
    /// Monotonic time the snapshot was taken.
    pub monotonic_time: f64,
    /// Scanning mode for local radios.
    pub current_mode: Option<ScanningMode>,
    /// Per-device summaries.
    pub discovered_devices: Vec<DiscoveredDeviceDiagnostics>,
}

/// Per-device entry in a scanner diagnostics snapshot.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDeviceDiagnostics {
    /// Device address.
    pub address: Address,
    /// Device name, if known.
    pub name: Option<String>,
    /// Last received signal strength.
    pub rssi: i16,
    /// Hex encoded manufacturer data by company id.
    pub manufacturer_data: HashMap<u16, String>,
    /// Seconds since the device was last seen.
    pub time_since_detection: Option<f64>,
}

/// Returns a [CallbackHandle] that stops the scanner's background tasks when
/// dropped.
pub(crate) fn unsetup_handle(core: &Arc<ScannerCore>) -> CallbackHandle {
    let core = Arc::downgrade(core);
    CallbackHandle::new(move || {
        if let Some(core) = core.upgrade() {
            core.unsetup();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> AdvertisementSink {
        Arc::new(|_info| {})
    }

    fn core() -> Arc<ScannerCore> {
        Arc::new(ScannerCore::new("aa:bb:cc:dd:ee:ff", "hci0", None, true, Some(0), sink()))
    }

    #[test]
    fn human_name_includes_adapter() {
        let core = core();
        assert_eq!(core.name, "hci0 (aa:bb:cc:dd:ee:ff)");
        let same = ScannerCore::new("esp-proxy", "esp-proxy", None, true, None, sink());
        assert_eq!(same.name, "esp-proxy");
    }

    #[test]
    fn connect_bookkeeping() {
        let core = core();
        let address = Address::new([1, 2, 3, 4, 5, 6]);

        core.add_connecting(address);
        {
            let state = core.state.lock().unwrap();
            assert_eq!(state.connecting, 1);
            assert!(state.in_progress.contains(&address));
            assert!(!state.scanning);
        }

        core.finished_connecting(address, false);
        {
            let state = core.state.lock().unwrap();
            assert_eq!(state.connecting, 0);
            assert!(state.scanning);
            assert_eq!(state.failures[&address], 1);
        }

        core.add_connecting(address);
        core.finished_connecting(address, true);
        assert!(core.state.lock().unwrap().failures.is_empty());
    }

    #[test]
    fn connecting_guard_restores_scanning() {
        let scanner =
            crate::scanner::remote::RemoteScanner::new("proxy", "proxy", sink(), None, true)
                .as_scanner();
        let guard = scanner.connecting();
        assert!(!scanner.scanning());
        assert_eq!(scanner.connections_in_progress(), 1);
        drop(guard);
        assert!(scanner.scanning());
        assert_eq!(scanner.connections_in_progress(), 0);
    }

    #[test]
    fn pause_hook_fires_for_local_adapters_only() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let paused = Arc::new(AtomicUsize::new(0));
        let address = Address::new([1, 2, 3, 4, 5, 6]);

        let local = core();
        let paused_in_hook = paused.clone();
        local.state.lock().unwrap().pause_hook =
            Some(Arc::new(move |_source| {
                paused_in_hook.fetch_add(1, Ordering::SeqCst);
            }));
        local.add_connecting(address);
        assert_eq!(paused.load(Ordering::SeqCst), 1);

        let remote =
            Arc::new(ScannerCore::new("proxy", "proxy", None, true, None, sink()));
        let paused_in_hook = paused.clone();
        remote.state.lock().unwrap().pause_hook =
            Some(Arc::new(move |_source| {
                paused_in_hook.fetch_add(1, Ordering::SeqCst);
            }));
        remote.add_connecting(address);
        assert_eq!(paused.load(Ordering::SeqCst), 1);
    }
}
