//! Central Bluetooth manager.
//!
//! Advertisements from all registered scanners arrive here. The manager
//! deduplicates them per address, decides which source currently has the best
//! view of a device, tracks staleness and unavailability, and fans the
//! winning records out to registered callbacks.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
    adapters::{AdapterDetails, AdapterOracle, AdapterRecovery, FAILED_ADAPTER_MAC},
    device::{AdvertisementData, BleDevice, ScannerDevice, ServiceInfo, NO_RSSI_VALUE},
    mgmt::MgmtChannel,
    monotonic_time,
    scanner::{AdvertisementSink, Scanner, ScannerDiagnostics},
    slots::{AllocationChangeEvent, Allocations, SlotManager},
    tracker::{AdvertisementTracker, TrackerDiagnostics, TRACKER_BUFFERING_WOBBLE_SECONDS},
    Address, CallbackHandle,
};

/// Period after which a cached advertisement loses authority for source
/// selection when no advertising interval has been learned.
pub const FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 195.0;

/// Stale horizon for connectable devices.
pub const CONNECTABLE_FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS: f64 = 195.0;

/// Minimum dB margin by which a new source must exceed the incumbent to
/// dethrone it before the staleness deadline.
pub const ADV_RSSI_SWITCH_THRESHOLD: i16 = 6;

/// Poll cadence of the unavailability tracking task.
pub const UNAVAILABLE_TRACK_SECONDS: Duration = Duration::from_secs(1);

const APPLE_MFR_ID: u16 = 76;
const APPLE_IBEACON_START_BYTE: u8 = 0x02;
const APPLE_HOMEKIT_START_BYTE: u8 = 0x06;
const APPLE_DEVICE_ID_START_BYTE: u8 = 0x10;
const APPLE_HOMEKIT_NOTIFY_START_BYTE: u8 = 0x11;
const APPLE_FINDMY_START_BYTE: u8 = 0x12;

/// Connection slot state of one scanner source.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SlotAllocations {
    /// Scanner source the allocations belong to.
    pub source: String,
    /// Total connection slots.
    pub slots: usize,
    /// Free connection slots.
    pub free: usize,
    /// Addresses currently holding a slot.
    pub allocated: Vec<Address>,
}

/// Scanner registry change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScannerRegistrationEvent {
    /// Scanner was registered.
    Added,
    /// Scanner was unregistered.
    Removed,
}

/// Notification of a scanner registry change.
#[derive(Clone, Debug)]
pub struct ScannerRegistration {
    /// What happened.
    pub event: ScannerRegistrationEvent,
    /// The scanner concerned.
    pub scanner: Scanner,
}

/// Advertisement callback in the bleak style: device plus advertisement.
pub type AdvertisementCallback = Arc<dyn Fn(&BleDevice, &AdvertisementData) + Send + Sync>;
type UnavailableCallback = Arc<dyn Fn(&ServiceInfo) + Send + Sync>;
type DisappearedCallback = Arc<dyn Fn(Address) + Send + Sync>;
type AllocationsCallback = Arc<dyn Fn(&SlotAllocations) + Send + Sync>;
type RegistrationCallback = Arc<dyn Fn(&ScannerRegistration) + Send + Sync>;
type DiscoveryHook = Arc<dyn Fn(&ServiceInfo) + Send + Sync>;

#[derive(Clone)]
struct BleakCallback {
    callback: AdvertisementCallback,
    filters: Option<HashSet<Uuid>>,
}

fn dispatch_bleak_callback(
    bleak_callback: &BleakCallback, device: &BleDevice, advertisement: &AdvertisementData,
) {
    if let Some(uuids) = &bleak_callback.filters {
        if uuids.is_disjoint(&advertisement.service_uuids) {
            return;
        }
    }
    (bleak_callback.callback)(device, advertisement);
}

#[derive(Default)]
struct ManagerState {
    tracker: AdvertisementTracker,
    all_history: HashMap<Address, ServiceInfo>,
    connectable_history: HashMap<Address, ServiceInfo>,
    connectable_scanners: HashSet<String>,
    non_connectable_scanners: HashSet<String>,
    sources: HashMap<String, Scanner>,
    adapter_sources: HashMap<String, String>,
    adapters: HashMap<String, AdapterDetails>,
    allocations: HashMap<String, SlotAllocations>,
    bleak_callbacks: HashMap<u64, BleakCallback>,
    unavailable_callbacks: HashMap<Address, HashMap<u64, UnavailableCallback>>,
    connectable_unavailable_callbacks: HashMap<Address, HashMap<u64, UnavailableCallback>>,
    disappeared_callbacks: HashMap<u64, DisappearedCallback>,
    allocations_callbacks: HashMap<Option<String>, HashMap<u64, AllocationsCallback>>,
    scanner_registration_callbacks: HashMap<Option<String>, HashMap<u64, RegistrationCallback>>,
    discovery_hook: Option<DiscoveryHook>,
    mgmt: Option<MgmtChannel>,
    next_callback_id: u64,
    tasks: Vec<JoinHandle<()>>,
    slot_callback_handle: Option<CallbackHandle>,
}

impl ManagerState {
    fn next_id(&mut self) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        id
    }
}

struct ManagerInner {
    state: Mutex<ManagerState>,
    slot_manager: SlotManager,
    oracle: Option<Arc<dyn AdapterOracle>>,
    recovery: Option<Arc<dyn AdapterRecovery>>,
    refresh_lock: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
}

/// The central manager.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("Manager")
            .field("scanners", &state.sources.len())
            .field("all_history", &state.all_history.len())
            .field("connectable_history", &state.connectable_history.len())
            .finish()
    }
}

impl Manager {
    /// Creates a manager.
    pub fn new(builder: ManagerBuilder) -> Self {
        let slot_manager = builder.slot_manager.unwrap_or_default();
        let manager = Self {
            inner: Arc::new(ManagerInner {
                state: Mutex::new(ManagerState::default()),
                slot_manager,
                oracle: builder.oracle,
                recovery: builder.recovery,
                refresh_lock: tokio::sync::Mutex::new(()),
                shutdown: AtomicBool::new(false),
            }),
        };
        let weak = manager.downgrade();
        let handle = manager.inner.slot_manager.register_allocation_callback(
            move |event: AllocationChangeEvent| {
                if let Some(manager) = Manager::upgrade(&weak) {
                    manager.slot_manager_changed(&event.adapter);
                }
            },
        );
        manager.inner.state.lock().unwrap().slot_callback_handle = Some(handle);
        manager
    }

    /// Builder for a manager.
    pub fn builder() -> ManagerBuilder {
        ManagerBuilder::default()
    }

    fn downgrade(&self) -> Weak<ManagerInner> {
        Arc::downgrade(&self.inner)
    }

    fn upgrade(weak: &Weak<ManagerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Set up the manager.
    ///
    /// Installs this manager as the process-wide one if none is set,
    /// refreshes the adapter oracle and starts unavailability tracking.
    pub async fn setup(&self) -> crate::Result<()> {
        crate::central::set_manager_if_unset(self.clone());
        if self.inner.oracle.is_some() {
            self.refresh_adapters().await?;
        }
        self.setup_unavailable_tracking();
        Ok(())
    }

    /// Stop the manager at shutdown.
    pub fn stop(&self) {
        log::debug!("Stopping bluetooth manager");
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let (tasks, handle) = {
            let mut state = self.inner.state.lock().unwrap();
            (std::mem::take(&mut state.tasks), state.slot_callback_handle.take())
        };
        for task in tasks {
            task.abort();
        }
        drop(handle);
    }

    /// Whether the manager has been stopped.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// The slot manager arbitrating per-adapter connection concurrency.
    pub fn slot_manager(&self) -> &SlotManager {
        &self.inner.slot_manager
    }

    /// Attach the MGMT channel used to load connection parameters.
    pub fn set_mgmt_channel(&self, channel: MgmtChannel) {
        self.inner.state.lock().unwrap().mgmt = Some(channel);
    }

    /// The attached MGMT channel, if any.
    pub fn mgmt_channel(&self) -> Option<MgmtChannel> {
        self.inner.state.lock().unwrap().mgmt.clone()
    }

    /// Sink delivering scanner advertisements into this manager.
    pub fn advertisement_sink(&self) -> AdvertisementSink {
        let weak = self.downgrade();
        Arc::new(move |service_info| {
            if let Some(manager) = Manager::upgrade(&weak) {
                manager.scanner_adv_received(service_info);
            }
        })
    }

    /// Install the single discovery hook invoked for every surfaced record.
    pub fn set_discovery_hook(&self, hook: impl Fn(&ServiceInfo) + Send + Sync + 'static) {
        self.inner.state.lock().unwrap().discovery_hook = Some(Arc::new(hook));
    }

    //
    // Scanner registry
    //

    /// Register a scanner.
    ///
    /// When `connection_slots` is given, the scanner's adapter is registered
    /// with the slot manager and an allocation change is published. Dropping
    /// the returned handle unregisters the scanner.
    pub fn register_scanner(
        &self, scanner: Scanner, connection_slots: Option<usize>,
    ) -> CallbackHandle {
        log::debug!("Registering scanner {}", scanner.name());
        let source = scanner.source().to_string();
        {
            let mut state = self.inner.state.lock().unwrap();
            if scanner.connectable() {
                state.connectable_scanners.insert(source.clone());
            } else {
                state.non_connectable_scanners.insert(source.clone());
                state.allocations.insert(
                    source.clone(),
                    SlotAllocations { source: source.clone(), slots: 0, free: 0, allocated: Vec::new() },
                );
            }
            scanner.clear_connection_history();
            state.sources.insert(source.clone(), scanner.clone());
            state.adapter_sources.insert(scanner.adapter().to_string(), source.clone());
        }

        if let Scanner::Local(_) = &scanner {
            let weak = self.downgrade();
            scanner.set_pause_hook(Some(Arc::new(move |paused_source: &str| {
                if let Some(inner) = weak.upgrade() {
                    inner.state.lock().unwrap().tracker.scanner_paused(paused_source);
                }
            })));
        }

        if let Some(slots) = connection_slots {
            self.inner.slot_manager.register_adapter(scanner.adapter(), slots);
        }
        self.on_scanner_registration(&scanner, ScannerRegistrationEvent::Added);

        let weak = self.downgrade();
        let unregister_scanner = scanner.clone();
        CallbackHandle::new(move || {
            if let Some(manager) = Manager::upgrade(&weak) {
                manager.unregister_scanner(&unregister_scanner, connection_slots);
            }
        })
    }

    fn unregister_scanner(&self, scanner: &Scanner, connection_slots: Option<usize>) {
        log::debug!("Unregistering scanner {}", scanner.name());
        {
            let mut state = self.inner.state.lock().unwrap();
            state.tracker.remove_source(scanner.source());
            state.connectable_scanners.remove(scanner.source());
            state.non_connectable_scanners.remove(scanner.source());
            scanner.clear_connection_history();
            state.sources.remove(scanner.source());
            state.adapter_sources.remove(scanner.adapter());
            state.allocations.remove(scanner.source());
        }
        scanner.set_pause_hook(None);
        scanner.set_allocations(None);
        if connection_slots.is_some() {
            self.inner.slot_manager.remove_adapter(scanner.adapter());
        }
        self.on_scanner_registration(scanner, ScannerRegistrationEvent::Removed);
    }

    /// Number of registered scanners.
    pub fn scanner_count(&self, connectable: bool) -> usize {
        let state = self.inner.state.lock().unwrap();
        if connectable {
            state.connectable_scanners.len()
        } else {
            state.connectable_scanners.len() + state.non_connectable_scanners.len()
        }
    }

    /// All registered scanners.
    pub fn current_scanners(&self) -> Vec<Scanner> {
        self.inner.state.lock().unwrap().sources.values().cloned().collect()
    }

    /// The scanner registered for a source.
    pub fn scanner_by_source(&self, source: &str) -> Option<Scanner> {
        self.inner.state.lock().unwrap().sources.get(source).cloned()
    }

    //
    // Ingestion
    //

    /// Handle a new advertisement from any scanner.
    ///
    /// This path is synchronous and never fails toward the caller; callback
    /// dispatch happens after all internal locks are released.
    pub fn scanner_adv_received(&self, service_info: ServiceInfo) {
        // Pre-filter noisy apple devices as they can account for 20-35% of
        // the traffic on a typical network.
        if service_info.service_data.is_empty() && service_info.manufacturer_data.len() == 1 {
            if let Some(apple_data) = service_info.manufacturer_data.get(&APPLE_MFR_ID) {
                if !apple_data.is_empty()
                    && !matches!(
                        apple_data[0],
                        APPLE_IBEACON_START_BYTE
                            | APPLE_HOMEKIT_START_BYTE
                            | APPLE_DEVICE_ID_START_BYTE
                            | APPLE_HOMEKIT_NOTIFY_START_BYTE
                            | APPLE_FINDMY_START_BYTE
                    )
                {
                    return;
                }
            }
        }

        let address = service_info.address;
        let (emit, bleak_callbacks, discovery_hook) = {
            let mut state = self.inner.state.lock().unwrap();

            let old_connectable_service_info = if service_info.connectable {
                state.connectable_history.get(&address).cloned()
            } else {
                None
            };
            let old_service_info = state.all_history.get(&address).cloned();

            // A device may be reachable through several scanners at once and
            // may be connectable on one but not another. all_history holds
            // the preferred record overall; connectable_history holds the
            // preferred record among connectable paths.
            if let Some(old_service_info) = &old_service_info {
                if old_service_info.source != service_info.source
                    && self.scanner_is_scanning(&state, &old_service_info.source)
                    && self.prefer_previous_adv_from_different_source(
                        &state,
                        old_service_info,
                        &service_info,
                    )
                {
                    // The new advertisement is rejected for all_history, but a
                    // connectable sighting may still have to refresh the
                    // connectable incumbent.
                    if service_info.connectable {
                        if let Some(old_connectable) = &old_connectable_service_info {
                            let keep_connectable = old_connectable.source
                                == old_service_info.source
                                || (old_connectable.source != service_info.source
                                    && self.scanner_is_scanning(&state, &old_connectable.source)
                                    && self.prefer_previous_adv_from_different_source(
                                        &state,
                                        old_connectable,
                                        &service_info,
                                    ));
                            if keep_connectable {
                                return;
                            }
                        }
                        state.connectable_history.insert(address, service_info.clone());
                    }
                    return;
                }
            }

            if service_info.connectable {
                state.connectable_history.insert(address, service_info.clone());
            }
            state.all_history.insert(address, service_info.clone());

            // Track advertisement intervals to determine when to switch
            // sources or mark a device as unavailable.
            if state
                .tracker
                .sources
                .get(&address)
                .is_some_and(|last_source| last_source != &service_info.source)
            {
                state.tracker.remove_address(&address);
            }
            if !state.tracker.intervals.contains_key(&address) {
                state.tracker.collect(&service_info);
            }

            // If the advertisement data is unchanged there is nothing to
            // dispatch, unless a connectable device was missing from the
            // connectable history and has to be surfaced again after
            // unavailable callbacks.
            let missing_connectable =
                service_info.connectable && old_connectable_service_info.is_none();
            if !missing_connectable {
                if let Some(old_service_info) = &old_service_info {
                    if service_info.manufacturer_data == old_service_info.manufacturer_data
                        && service_info.service_data == old_service_info.service_data
                        && service_info.service_uuids == old_service_info.service_uuids
                        && service_info.name == old_service_info.name
                    {
                        return;
                    }
                }
            }

            let connectable_incumbent =
                service_info.connectable || state.connectable_history.contains_key(&address);
            let emit = if !service_info.connectable && connectable_incumbent {
                // A connectable path exists, so connection attempts will be
                // routed there; surface the record as connectable.
                service_info.as_connectable()
            } else {
                service_info
            };

            // Bleak-style callbacks only receive records with a connectable
            // path.
            let bleak_callbacks: Vec<BleakCallback> = if emit.connectable {
                state.bleak_callbacks.values().cloned().collect()
            } else {
                Vec::new()
            };
            (emit, bleak_callbacks, state.discovery_hook.clone())
        };

        if !bleak_callbacks.is_empty() {
            let advertisement = emit.advertisement();
            for bleak_callback in &bleak_callbacks {
                dispatch_bleak_callback(bleak_callback, &emit.device, &advertisement);
            }
        }
        if let Some(discovery_hook) = discovery_hook {
            discovery_hook(&emit);
        }
    }

    fn scanner_is_scanning(&self, state: &ManagerState, source: &str) -> bool {
        state.sources.get(source).map(Scanner::scanning).unwrap_or(false)
    }

    /// Prefer the previous advertisement from a different source if it is
    /// still fresh and not clearly weaker.
    fn prefer_previous_adv_from_different_source(
        &self, state: &ManagerState, old: &ServiceInfo, new: &ServiceInfo,
    ) -> bool {
        let learned = state
            .tracker
            .intervals
            .get(&new.address)
            .or_else(|| state.tracker.fallback_intervals.get(&new.address))
            .copied()
            .filter(|interval| *interval > 0.0);
        let stale_seconds = match learned {
            Some(interval) => interval + TRACKER_BUFFERING_WOBBLE_SECONDS,
            None => FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS,
        };
        if new.time - old.time > stale_seconds {
            // The old advertisement is stale, any new advertisement wins.
            log::debug!(
                "{} ({}): Switching from {} to {} (time elapsed:{} > stale seconds:{})",
                new.name.as_deref().unwrap_or(""),
                new.address,
                self.describe_source(state, old),
                self.describe_source(state, new),
                new.time - old.time,
                stale_seconds
            );
            return false;
        }
        if effective_rssi(new.rssi) - ADV_RSSI_SWITCH_THRESHOLD > effective_rssi(old.rssi) {
            log::debug!(
                "{} ({}): Switching from {} to {} (new rssi:{} - threshold:{} > old rssi:{})",
                new.name.as_deref().unwrap_or(""),
                new.address,
                self.describe_source(state, old),
                self.describe_source(state, new),
                new.rssi,
                ADV_RSSI_SWITCH_THRESHOLD,
                old.rssi
            );
            return false;
        }
        true
    }

    fn describe_source(&self, state: &ManagerState, service_info: &ServiceInfo) -> String {
        let mut description = match state.sources.get(&service_info.source) {
            Some(scanner) => scanner.name().to_string(),
            None => service_info.source.clone(),
        };
        if service_info.connectable {
            description += " [connectable]";
        }
        description
    }

    //
    // Unavailability tracking
    //

    /// Start the periodic unavailability check.
    pub fn setup_unavailable_tracking(&self) {
        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(UNAVAILABLE_TRACK_SECONDS).await;
                let Some(manager) = Manager::upgrade(&weak) else { break };
                if manager.is_shutdown() {
                    break;
                }
                manager.check_unavailable();
            }
        });
        self.inner.state.lock().unwrap().tasks.push(task);
    }

    /// Watch for unavailable devices and clean up state history.
    fn check_unavailable(&self) {
        let monotonic_now = monotonic_time();
        for connectable in [true, false] {
            let mut expired: Vec<(ServiceInfo, Vec<UnavailableCallback>)> = Vec::new();
            let mut disappeared_dispatch: Vec<(Address, Vec<DisappearedCallback>)> = Vec::new();
            {
                let mut state = self.inner.state.lock().unwrap();
                let discovered = self.all_discovered_addresses(&state, connectable);
                let history = if connectable {
                    &state.connectable_history
                } else {
                    &state.all_history
                };
                let disappeared: Vec<Address> =
                    history.keys().copied().filter(|address| !discovered.contains(address)).collect();

                for address in disappeared {
                    if !connectable {
                        // A non-connectable device may simply have gone to
                        // sleep; without a connection there is no way to tell,
                        // so it only becomes unavailable once its advertising
                        // interval has clearly been exceeded.
                        let advertising_interval = state
                            .tracker
                            .intervals
                            .get(&address)
                            .or_else(|| state.tracker.fallback_intervals.get(&address))
                            .copied()
                            .filter(|interval| *interval > 0.0)
                            .map(|interval| interval + TRACKER_BUFFERING_WOBBLE_SECONDS)
                            .unwrap_or(FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS);
                        let time_since_seen =
                            monotonic_now - state.all_history[&address].time;
                        if time_since_seen <= advertising_interval {
                            continue;
                        }

                        // This pass is responsible for dropping the interval
                        // tracking since the device is now gone for both the
                        // connectable and non-connectable views.
                        state.tracker.remove_fallback_interval(&address);
                        state.tracker.remove_address(&address);
                        disappeared_dispatch
                            .push((address, state.disappeared_callbacks.values().cloned().collect()));
                    }

                    let history = if connectable {
                        &mut state.connectable_history
                    } else {
                        &mut state.all_history
                    };
                    let Some(service_info) = history.remove(&address) else { continue };

                    let unavailable_callbacks = if connectable {
                        &state.connectable_unavailable_callbacks
                    } else {
                        &state.unavailable_callbacks
                    };
                    let callbacks = unavailable_callbacks
                        .get(&address)
                        .map(|callbacks| callbacks.values().cloned().collect())
                        .unwrap_or_default();
                    expired.push((service_info, callbacks));
                }
            }

            for (address, callbacks) in disappeared_dispatch {
                for callback in callbacks {
                    callback(address);
                }
            }
            for (service_info, callbacks) in expired {
                for callback in callbacks {
                    callback(&service_info);
                }
            }
        }
    }

    /// All addresses currently discovered by the relevant scanner set,
    /// including duplicates across scanners.
    fn all_discovered_addresses(&self, state: &ManagerState, connectable: bool) -> HashSet<Address> {
        let mut discovered = HashSet::new();
        for source in &state.connectable_scanners {
            if let Some(scanner) = state.sources.get(source) {
                discovered.extend(scanner.discovered_addresses());
            }
        }
        if !connectable {
            for source in &state.non_connectable_scanners {
                if let Some(scanner) = state.sources.get(source) {
                    discovered.extend(scanner.discovered_addresses());
                }
            }
        }
        discovered
    }

    //
    // Query surface
    //

    /// Device handle for an address if present in the history.
    pub fn ble_device_from_address(&self, address: &Address, connectable: bool) -> Option<BleDevice> {
        let state = self.inner.state.lock().unwrap();
        let histories = if connectable { &state.connectable_history } else { &state.all_history };
        histories.get(address).map(|service_info| service_info.device.clone())
    }

    /// Whether the address is present in the history.
    pub fn address_present(&self, address: &Address, connectable: bool) -> bool {
        let state = self.inner.state.lock().unwrap();
        let histories = if connectable { &state.connectable_history } else { &state.all_history };
        histories.contains_key(address)
    }

    /// All currently preferred records.
    pub fn discovered_service_info(&self, connectable: bool) -> Vec<ServiceInfo> {
        let state = self.inner.state.lock().unwrap();
        let histories = if connectable { &state.connectable_history } else { &state.all_history };
        histories.values().cloned().collect()
    }

    /// The currently preferred record for an address.
    pub fn last_service_info(&self, address: &Address, connectable: bool) -> Option<ServiceInfo> {
        let state = self.inner.state.lock().unwrap();
        let histories = if connectable { &state.connectable_history } else { &state.all_history };
        histories.get(address).cloned()
    }

    /// Best-path devices across all scanners.
    pub fn discovered_devices(&self, connectable: bool) -> Vec<BleDevice> {
        let state = self.inner.state.lock().unwrap();
        let histories = if connectable { &state.connectable_history } else { &state.all_history };
        histories.values().map(|service_info| service_info.device.clone()).collect()
    }

    /// All scanner paths to an address.
    pub fn scanner_devices_by_address(
        &self, address: &Address, connectable: bool,
    ) -> Vec<ScannerDevice> {
        let state = self.inner.state.lock().unwrap();
        let mut scanners: Vec<&Scanner> = state
            .connectable_scanners
            .iter()
            .filter_map(|source| state.sources.get(source))
            .collect();
        if !connectable {
            scanners.extend(
                state.non_connectable_scanners.iter().filter_map(|source| state.sources.get(source)),
            );
        }
        scanners
            .into_iter()
            .filter_map(|scanner| {
                scanner.get_discovered_device_advertisement_data(address).map(
                    |(device, advertisement)| ScannerDevice {
                        scanner: scanner.clone(),
                        device,
                        advertisement,
                    },
                )
            })
            .collect()
    }

    //
    // Advertising intervals
    //

    /// Learned advertising interval for an address.
    pub fn learned_advertising_interval(&self, address: &Address) -> Option<f64> {
        self.inner.state.lock().unwrap().tracker.intervals.get(address).copied()
    }

    /// Fallback availability interval for an address.
    pub fn fallback_availability_interval(&self, address: &Address) -> Option<f64> {
        self.inner.state.lock().unwrap().tracker.fallback_intervals.get(address).copied()
    }

    /// Override the fallback availability interval for an address.
    pub fn set_fallback_availability_interval(&self, address: Address, interval: f64) {
        self.inner.state.lock().unwrap().tracker.fallback_intervals.insert(address, interval);
    }

    //
    // Connection slots
    //

    /// Allocate a connection slot on the adapter for the address.
    pub fn allocate_connection_slot(&self, adapter: &str, address: Address) -> bool {
        self.inner.slot_manager.allocate_slot(adapter, address)
    }

    /// Release a connection slot on the adapter for the address.
    pub fn release_connection_slot(&self, adapter: &str, address: Address) {
        self.inner.slot_manager.release_slot(adapter, address);
    }

    fn slot_manager_changed(&self, adapter: &str) {
        if let Some(allocations) = self.inner.slot_manager.get_allocations(adapter) {
            self.on_allocation_changed(allocations);
        }
    }

    /// Publish an allocation change to subscribers.
    pub fn on_allocation_changed(&self, allocations: Allocations) {
        let (slot_allocations, callbacks) = {
            let mut state = self.inner.state.lock().unwrap();
            let source = state
                .adapter_sources
                .get(&allocations.adapter)
                .cloned()
                .unwrap_or_else(|| allocations.adapter.clone());
            let slot_allocations = SlotAllocations {
                source: source.clone(),
                slots: allocations.slots,
                free: allocations.free,
                allocated: allocations.allocated,
            };
            state.allocations.insert(source.clone(), slot_allocations.clone());
            if let Some(scanner) = state.sources.get(&source) {
                scanner.set_allocations(Some(slot_allocations.clone()));
            }
            let mut callbacks: Vec<AllocationsCallback> = Vec::new();
            for source_key in [Some(source), None] {
                if let Some(registered) = state.allocations_callbacks.get(&source_key) {
                    callbacks.extend(registered.values().cloned());
                }
            }
            (slot_allocations, callbacks)
        };
        for callback in callbacks {
            callback(&slot_allocations);
        }
    }

    /// Current slot allocations, optionally restricted to one source.
    pub fn current_allocations(&self, source: Option<&str>) -> Vec<SlotAllocations> {
        let state = self.inner.state.lock().unwrap();
        match source {
            Some(source) => state.allocations.get(source).cloned().into_iter().collect(),
            None => state.allocations.values().cloned().collect(),
        }
    }

    //
    // Callback registries
    //

    /// Register a bleak-style advertisement callback with an optional UUID
    /// filter.
    ///
    /// The connectable history is replayed so devices discovered before the
    /// registration are not missed.
    pub fn register_bleak_callback(
        &self, callback: impl Fn(&BleDevice, &AdvertisementData) + Send + Sync + 'static,
        filters: Option<HashSet<Uuid>>,
    ) -> CallbackHandle {
        let entry = BleakCallback { callback: Arc::new(callback), filters };
        let (id, history) = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id();
            state.bleak_callbacks.insert(id, entry.clone());
            let history: Vec<ServiceInfo> = state.connectable_history.values().cloned().collect();
            (id, history)
        };
        for service_info in history {
            dispatch_bleak_callback(&entry, &service_info.device, &service_info.advertisement());
        }
        let weak = self.downgrade();
        CallbackHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().unwrap().bleak_callbacks.remove(&id);
            }
        })
    }

    /// Register a callback invoked when the address becomes unavailable.
    pub fn register_unavailable_callback(
        &self, callback: impl Fn(&ServiceInfo) + Send + Sync + 'static, address: Address,
        connectable: bool,
    ) -> CallbackHandle {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id();
            let callbacks = if connectable {
                &mut state.connectable_unavailable_callbacks
            } else {
                &mut state.unavailable_callbacks
            };
            callbacks.entry(address).or_default().insert(id, Arc::new(callback));
            id
        };
        let weak = self.downgrade();
        CallbackHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap();
                let callbacks = if connectable {
                    &mut state.connectable_unavailable_callbacks
                } else {
                    &mut state.unavailable_callbacks
                };
                if let Some(registered) = callbacks.get_mut(&address) {
                    registered.remove(&id);
                    if registered.is_empty() {
                        callbacks.remove(&address);
                    }
                }
            }
        })
    }

    /// Register a callback invoked when an address disappears from the
    /// non-connectable view.
    pub fn register_disappeared_callback(
        &self, callback: impl Fn(Address) + Send + Sync + 'static,
    ) -> CallbackHandle {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id();
            state.disappeared_callbacks.insert(id, Arc::new(callback));
            id
        };
        let weak = self.downgrade();
        CallbackHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().unwrap().disappeared_callbacks.remove(&id);
            }
        })
    }

    /// Register a callback invoked when slot allocations change, optionally
    /// restricted to one source.
    pub fn register_allocation_callback(
        &self, callback: impl Fn(&SlotAllocations) + Send + Sync + 'static, source: Option<String>,
    ) -> CallbackHandle {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id();
            state.allocations_callbacks.entry(source.clone()).or_default().insert(id, Arc::new(callback));
            id
        };
        let weak = self.downgrade();
        CallbackHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap();
                if let Some(registered) = state.allocations_callbacks.get_mut(&source) {
                    registered.remove(&id);
                    if registered.is_empty() {
                        state.allocations_callbacks.remove(&source);
                    }
                }
            }
        })
    }

    /// Register a callback invoked when a scanner is added or removed,
    /// optionally restricted to one source.
    pub fn register_scanner_registration_callback(
        &self, callback: impl Fn(&ScannerRegistration) + Send + Sync + 'static,
        source: Option<String>,
    ) -> CallbackHandle {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id();
            state
                .scanner_registration_callbacks
                .entry(source.clone())
                .or_default()
                .insert(id, Arc::new(callback));
            id
        };
        let weak = self.downgrade();
        CallbackHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().unwrap();
                if let Some(registered) = state.scanner_registration_callbacks.get_mut(&source) {
                    registered.remove(&id);
                    if registered.is_empty() {
                        state.scanner_registration_callbacks.remove(&source);
                    }
                }
            }
        })
    }

    fn on_scanner_registration(&self, scanner: &Scanner, event: ScannerRegistrationEvent) {
        let callbacks: Vec<RegistrationCallback> = {
            let state = self.inner.state.lock().unwrap();
            let mut callbacks = Vec::new();
            for source_key in [Some(scanner.source().to_string()), None] {
                if let Some(registered) = state.scanner_registration_callbacks.get(&source_key) {
                    callbacks.extend(registered.values().cloned());
                }
            }
            callbacks
        };
        let registration = ScannerRegistration { event, scanner: scanner.clone() };
        for callback in callbacks {
            callback(&registration);
        }
    }

    //
    // Adapters
    //

    /// Whether any known adapter supports passive scanning.
    pub fn supports_passive_scan(&self) -> bool {
        self.inner.state.lock().unwrap().adapters.values().any(|details| details.passive_scan)
    }

    /// Refresh the adapter oracle.
    pub async fn refresh_adapters(&self) -> crate::Result<()> {
        let Some(oracle) = self.inner.oracle.clone() else { return Ok(()) };
        let _refresh = self.inner.refresh_lock.lock().await;
        oracle.refresh().await?;
        self.inner.state.lock().unwrap().adapters = oracle.adapters();
        Ok(())
    }

    /// Known adapters, refreshing when `cached` is false or nothing is known.
    pub async fn bluetooth_adapters(&self, cached: bool) -> crate::Result<HashMap<String, AdapterDetails>> {
        let empty = self.inner.state.lock().unwrap().adapters.is_empty();
        if empty || !cached {
            self.refresh_adapters().await?;
        }
        Ok(self.inner.state.lock().unwrap().adapters.clone())
    }

    fn find_adapter_by_address(&self, address: Address) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        state
            .adapters
            .iter()
            .find(|(_, details)| details.address == address)
            .map(|(adapter, _)| adapter.clone())
    }

    /// Adapter name for an adapter address, refreshing the oracle when the
    /// address is unknown.
    pub async fn adapter_from_address(&self, address: Address) -> crate::Result<Option<String>> {
        if let Some(adapter) = self.find_adapter_by_address(address) {
            return Ok(Some(adapter));
        }
        self.refresh_adapters().await?;
        Ok(self.find_adapter_by_address(address))
    }

    /// Adapter name for an adapter address, attempting hardware recovery of
    /// failed adapters when the address is unknown.
    pub async fn adapter_from_address_or_recover(
        &self, address: Address,
    ) -> crate::Result<Option<String>> {
        if let Some(adapter) = self.find_adapter_by_address(address) {
            return Ok(Some(adapter));
        }
        self.recover_failed_adapters().await?;
        Ok(self.find_adapter_by_address(address))
    }

    async fn recover_failed_adapters(&self) -> crate::Result<()> {
        let Some(recovery) = self.inner.recovery.clone() else {
            return self.refresh_adapters().await;
        };
        let adapters = self.bluetooth_adapters(true).await?;
        for (adapter, details) in adapters {
            if details.address == FAILED_ADAPTER_MAC {
                if let Err(err) = recovery.reset_adapter(&adapter, FAILED_ADAPTER_MAC).await {
                    log::debug!("{adapter}: adapter reset failed: {err}");
                }
            }
        }
        self.refresh_adapters().await
    }

    //
    // Diagnostics
    //

    /// Structured snapshot of the manager state.
    pub fn diagnostics(&self) -> ManagerDiagnostics {
        let state = self.inner.state.lock().unwrap();
        ManagerDiagnostics {
            adapters: state.adapters.clone(),
            slot_manager: self.inner.slot_manager.diagnostics(),
            allocations: state.allocations.clone(),
            scanners: state.sources.values().map(Scanner::diagnostics).collect(),
            connectable_history: state.connectable_history.values().cloned().collect(),
            all_history: state.all_history.values().cloned().collect(),
            advertisement_tracker: state.tracker.diagnostics(),
        }
    }

    #[cfg(test)]
    pub(crate) fn history_sources(&self, address: &Address) -> (Option<String>, Option<String>) {
        let state = self.inner.state.lock().unwrap();
        (
            state.all_history.get(address).map(|service_info| service_info.source.clone()),
            state.connectable_history.get(address).map(|service_info| service_info.source.clone()),
        )
    }
}

/// Configuration for a [Manager].
#[derive(Default)]
pub struct ManagerBuilder {
    oracle: Option<Arc<dyn AdapterOracle>>,
    recovery: Option<Arc<dyn AdapterRecovery>>,
    slot_manager: Option<SlotManager>,
}

impl ManagerBuilder {
    /// Use the given adapter oracle.
    pub fn oracle(mut self, oracle: Arc<dyn AdapterOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Use the given hardware recovery hook.
    pub fn recovery(mut self, recovery: Arc<dyn AdapterRecovery>) -> Self {
        self.recovery = Some(recovery);
        self
    }

    /// Use the given slot manager.
    pub fn slot_manager(mut self, slot_manager: SlotManager) -> Self {
        self.slot_manager = Some(slot_manager);
        self
    }

    /// Build the manager.
    pub fn build(self) -> Manager {
        Manager::new(self)
    }
}

/// Structured snapshot of the manager state.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ManagerDiagnostics {
    /// Known adapters.
    pub adapters: HashMap<String, AdapterDetails>,
    /// Slot manager state.
    pub slot_manager: Vec<Allocations>,
    /// Per-source slot allocations.
    pub allocations: HashMap<String, SlotAllocations>,
    /// Per-scanner diagnostics.
    pub scanners: Vec<ScannerDiagnostics>,
    /// Connectable history records.
    pub connectable_history: Vec<ServiceInfo>,
    /// All history records.
    pub all_history: Vec<ServiceInfo>,
    /// Tracker state.
    pub advertisement_tracker: TrackerDiagnostics,
}

fn effective_rssi(rssi: i16) -> i16 {
    if rssi == 0 {
        NO_RSSI_VALUE
    } else {
        rssi
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{local::uuid_from_u16, RemoteScanner};
    use std::sync::Mutex as StdMutex;

    fn manager() -> Manager {
        Manager::builder().build()
    }

    fn scanner(manager: &Manager, id: &str, connectable: bool) -> RemoteScanner {
        RemoteScanner::new(id, id, manager.advertisement_sink(), None, connectable)
    }

    fn inject(scanner: &RemoteScanner, address: Address, rssi: i16, name: &str, time: f64) {
        scanner.on_advertisement(
            address,
            rssi,
            Some(name.to_string()),
            HashSet::new(),
            HashMap::new(),
            [(1u16, vec![0x01])].into_iter().collect(),
            None,
            time,
        );
    }

    fn addr() -> Address {
        "44:44:33:11:23:45".parse().unwrap()
    }

    #[tokio::test]
    async fn cross_source_preference() {
        let manager = manager();
        let scanner_a = scanner(&manager, "scanner-a", true);
        let scanner_b = scanner(&manager, "scanner-b", true);
        let _reg_a = manager.register_scanner(scanner_a.as_scanner(), None);
        let _reg_b = manager.register_scanner(scanner_b.as_scanner(), None);

        inject(&scanner_a, addr(), -60, "dev", 1.0);
        inject(&scanner_b, addr(), -80, "dev", 2.0);
        let (all, connectable) = manager.history_sources(&addr());
        assert_eq!(all.as_deref(), Some("scanner-a"));
        assert_eq!(connectable.as_deref(), Some("scanner-a"));

        // A margin beyond the switch threshold dethrones the incumbent.
        inject(&scanner_a, addr(), -95, "dev", 3.0);
        inject(&scanner_b, addr(), -55, "dev", 4.0);
        let (all, connectable) = manager.history_sources(&addr());
        assert_eq!(all.as_deref(), Some("scanner-b"));
        assert_eq!(connectable.as_deref(), Some("scanner-b"));
    }

    #[tokio::test]
    async fn stale_incumbent_loses() {
        let manager = manager();
        let scanner_a = scanner(&manager, "scanner-a", true);
        let scanner_b = scanner(&manager, "scanner-b", true);
        let _reg_a = manager.register_scanner(scanner_a.as_scanner(), None);
        let _reg_b = manager.register_scanner(scanner_b.as_scanner(), None);

        inject(&scanner_a, addr(), -60, "dev", 1.0);
        // Weaker, but the incumbent is past the fallback stale horizon.
        inject(
            &scanner_b,
            addr(),
            -80,
            "dev",
            1.0 + FALLBACK_MAXIMUM_STALE_ADVERTISEMENT_SECONDS + 1.0,
        );
        let (all, _) = manager.history_sources(&addr());
        assert_eq!(all.as_deref(), Some("scanner-b"));
    }

    #[tokio::test]
    async fn incumbent_from_stopped_scanner_loses() {
        let manager = manager();
        let scanner_a = scanner(&manager, "scanner-a", true);
        let scanner_b = scanner(&manager, "scanner-b", true);
        let reg_a = manager.register_scanner(scanner_a.as_scanner(), None);
        let _reg_b = manager.register_scanner(scanner_b.as_scanner(), None);

        inject(&scanner_a, addr(), -60, "dev", 1.0);
        drop(reg_a);
        inject(&scanner_b, addr(), -80, "dev", 2.0);
        let (all, _) = manager.history_sources(&addr());
        assert_eq!(all.as_deref(), Some("scanner-b"));
    }

    #[tokio::test]
    async fn apple_noise_is_prefiltered() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);
        let _reg = manager.register_scanner(proxy.as_scanner(), None);

        let noise: HashMap<u16, Vec<u8>> = [(76u16, vec![0x4f, 0x01])].into_iter().collect();
        proxy.on_advertisement(addr(), -60, None, HashSet::new(), HashMap::new(), noise, None, 1.0);
        assert!(!manager.address_present(&addr(), false));

        // A FindMy prefix is let through.
        let findmy: HashMap<u16, Vec<u8>> = [(76u16, vec![0x12, 0x01])].into_iter().collect();
        proxy
            .on_advertisement(addr(), -60, None, HashSet::new(), HashMap::new(), findmy, None, 2.0);
        assert!(manager.address_present(&addr(), false));
    }

    #[tokio::test]
    async fn apple_noise_with_other_manufacturer_passes() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);
        let _reg = manager.register_scanner(proxy.as_scanner(), None);

        let data: HashMap<u16, Vec<u8>> =
            [(76u16, vec![0x4f, 0x01]), (0x0001u16, vec![0x02])].into_iter().collect();
        proxy.on_advertisement(addr(), -60, None, HashSet::new(), HashMap::new(), data, None, 1.0);
        assert!(manager.address_present(&addr(), false));
    }

    #[tokio::test]
    async fn unchanged_advertisement_is_suppressed() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);
        let _reg = manager.register_scanner(proxy.as_scanner(), None);

        let fired = Arc::new(StdMutex::new(0));
        let fired_in_callback = fired.clone();
        let _callback = manager.register_bleak_callback(
            move |_device, _advertisement| {
                *fired_in_callback.lock().unwrap() += 1;
            },
            None,
        );

        inject(&proxy, addr(), -60, "dev", 1.0);
        assert_eq!(*fired.lock().unwrap(), 1);
        // Same advertisement content again; only the rssi and time moved.
        inject(&proxy, addr(), -61, "dev", 2.0);
        assert_eq!(*fired.lock().unwrap(), 1);
        // Content change dispatches again.
        proxy.on_advertisement(
            addr(),
            -61,
            Some("dev".into()),
            [uuid_from_u16(0x180d)].into_iter().collect(),
            HashMap::new(),
            HashMap::new(),
            None,
            3.0,
        );
        assert_eq!(*fired.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn non_connectable_record_surfaced_as_connectable() {
        let manager = manager();
        let connectable_proxy = scanner(&manager, "conn-proxy", true);
        let passive_proxy = scanner(&manager, "passive-proxy", false);
        let _reg_a = manager.register_scanner(connectable_proxy.as_scanner(), None);
        let _reg_b = manager.register_scanner(passive_proxy.as_scanner(), None);

        let surfaced = Arc::new(StdMutex::new(Vec::new()));
        let surfaced_in_hook = surfaced.clone();
        manager.set_discovery_hook(move |service_info| {
            surfaced_in_hook.lock().unwrap().push(service_info.clone());
        });

        inject(&connectable_proxy, addr(), -70, "dev", 1.0);
        // The passive sighting is better by more than the threshold.
        inject(&passive_proxy, addr(), -50, "dev2", 2.0);

        let surfaced = surfaced.lock().unwrap();
        let last = surfaced.last().unwrap();
        assert_eq!(last.source, "passive-proxy");
        assert!(last.connectable);
        // The connectable history still points at the connectable path.
        let (_, connectable) = manager.history_sources(&addr());
        assert_eq!(connectable.as_deref(), Some("conn-proxy"));
    }

    #[tokio::test]
    async fn bleak_callback_replay_and_filter() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);
        let _reg = manager.register_scanner(proxy.as_scanner(), None);

        proxy.on_advertisement(
            addr(),
            -60,
            Some("dev".into()),
            [uuid_from_u16(0x180d)].into_iter().collect(),
            HashMap::new(),
            HashMap::new(),
            None,
            1.0,
        );

        let matched = Arc::new(StdMutex::new(0));
        let matched_in_callback = matched.clone();
        let _matching = manager.register_bleak_callback(
            move |_device, _advertisement| {
                *matched_in_callback.lock().unwrap() += 1;
            },
            Some([uuid_from_u16(0x180d)].into_iter().collect()),
        );
        assert_eq!(*matched.lock().unwrap(), 1);

        let unmatched = Arc::new(StdMutex::new(0));
        let unmatched_in_callback = unmatched.clone();
        let _not_matching = manager.register_bleak_callback(
            move |_device, _advertisement| {
                *unmatched_in_callback.lock().unwrap() += 1;
            },
            Some([uuid_from_u16(0xfff0)].into_iter().collect()),
        );
        assert_eq!(*unmatched.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connectable_device_becomes_unavailable() {
        let manager = manager();
        manager.setup_unavailable_tracking();
        let proxy = scanner(&manager, "proxy", true);
        let registration = manager.register_scanner(proxy.as_scanner(), None);

        let unavailable = Arc::new(StdMutex::new(Vec::new()));
        let unavailable_in_callback = unavailable.clone();
        let _callback = manager.register_unavailable_callback(
            move |service_info| {
                unavailable_in_callback.lock().unwrap().push(service_info.clone());
            },
            addr(),
            true,
        );

        inject(&proxy, addr(), -60, "dev", monotonic_time());
        assert!(manager.address_present(&addr(), true));

        // Once the scanner is gone the address is no longer discovered by any
        // connectable scanner.
        drop(registration);
        tokio::time::advance(UNAVAILABLE_TRACK_SECONDS).await;
        tokio::task::yield_now().await;

        assert!(!manager.address_present(&addr(), true));
        assert_eq!(unavailable.lock().unwrap().len(), 1);
        // The non-connectable view keeps the record until the advertising
        // interval is clearly exceeded.
        assert!(manager.address_present(&addr(), false));
    }

    #[tokio::test(start_paused = true)]
    async fn non_connectable_eviction_waits_for_interval() {
        let manager = manager();
        manager.setup_unavailable_tracking();
        let proxy = scanner(&manager, "proxy", true);
        let registration = manager.register_scanner(proxy.as_scanner(), None);

        let disappeared = Arc::new(StdMutex::new(Vec::new()));
        let disappeared_in_callback = disappeared.clone();
        let _callback = manager.register_disappeared_callback(move |address| {
            disappeared_in_callback.lock().unwrap().push(address);
        });

        manager.set_fallback_availability_interval(addr(), 60.0);
        inject(&proxy, addr(), -60, "dev", monotonic_time());
        drop(registration);

        tokio::time::advance(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;
        assert!(manager.address_present(&addr(), false));
        assert!(disappeared.lock().unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(40)).await;
        tokio::task::yield_now().await;
        assert!(!manager.address_present(&addr(), false));
        assert_eq!(disappeared.lock().unwrap().as_slice(), &[addr()]);
        assert_eq!(manager.fallback_availability_interval(&addr()), None);
        assert_eq!(manager.learned_advertising_interval(&addr()), None);
    }

    #[tokio::test]
    async fn unregister_clears_all_scanner_state() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);
        let registration = manager.register_scanner(proxy.as_scanner(), Some(2));

        inject(&proxy, addr(), -60, "dev", 1.0);
        assert!(manager.scanner_by_source("proxy").is_some());
        assert_eq!(manager.scanner_count(true), 1);
        assert_eq!(manager.current_allocations(Some("proxy")).len(), 1);

        drop(registration);

        assert!(manager.scanner_by_source("proxy").is_none());
        assert_eq!(manager.scanner_count(false), 0);
        assert!(manager.current_allocations(Some("proxy")).is_empty());
        assert!(manager.current_scanners().is_empty());
        let diagnostics = manager.diagnostics();
        assert!(diagnostics.advertisement_tracker.sources.is_empty());
        assert!(manager.slot_manager().get_allocations("proxy").is_none());
    }

    #[tokio::test]
    async fn allocation_events_are_keyed_by_source() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_in_callback = seen.clone();
        let _callback = manager.register_allocation_callback(
            move |allocations| {
                seen_in_callback.lock().unwrap().push(allocations.clone());
            },
            Some("proxy".to_string()),
        );

        let _registration = manager.register_scanner(proxy.as_scanner(), Some(2));
        assert!(manager.allocate_connection_slot("proxy", addr()));

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        let last = seen.last().unwrap();
        assert_eq!(last.source, "proxy");
        assert_eq!(last.slots, 2);
        assert_eq!(last.free, 1);
        assert_eq!(last.allocated, vec![addr()]);
    }

    #[tokio::test]
    async fn scanner_registration_events() {
        let manager = manager();
        let proxy = scanner(&manager, "proxy", true);

        let events = Arc::new(StdMutex::new(Vec::new()));
        let events_in_callback = events.clone();
        let _callback = manager.register_scanner_registration_callback(
            move |registration| {
                events_in_callback.lock().unwrap().push(registration.event);
            },
            None,
        );

        let registration = manager.register_scanner(proxy.as_scanner(), None);
        drop(registration);

        assert_eq!(
            events.lock().unwrap().as_slice(),
            &[ScannerRegistrationEvent::Added, ScannerRegistrationEvent::Removed]
        );
    }

    #[tokio::test]
    async fn connectable_history_is_subset_of_all_history() {
        let manager = manager();
        let connectable_proxy = scanner(&manager, "conn", true);
        let passive_proxy = scanner(&manager, "passive", false);
        let _reg_a = manager.register_scanner(connectable_proxy.as_scanner(), None);
        let _reg_b = manager.register_scanner(passive_proxy.as_scanner(), None);

        inject(&connectable_proxy, addr(), -70, "dev", 1.0);
        inject(&passive_proxy, addr(), -50, "dev", 2.0);

        for service_info in manager.discovered_service_info(true) {
            assert!(manager.address_present(&service_info.address, false));
        }
    }

    #[tokio::test]
    async fn tracker_reset_on_source_change() {
        let manager = manager();
        let scanner_a = scanner(&manager, "scanner-a", true);
        let scanner_b = scanner(&manager, "scanner-b", true);
        let _reg_a = manager.register_scanner(scanner_a.as_scanner(), None);
        let _reg_b = manager.register_scanner(scanner_b.as_scanner(), None);

        inject(&scanner_a, addr(), -60, "dev", 1.0);
        // The stronger source takes over; the half-filled timing window from
        // the old source must not poison the estimator.
        inject(&scanner_b, addr(), -40, "dev", 2.0);

        let diagnostics = manager.diagnostics();
        assert_eq!(
            diagnostics.advertisement_tracker.sources.get(&addr()).map(String::as_str),
            Some("scanner-b")
        );
        assert_eq!(
            diagnostics.advertisement_tracker.timings.get(&addr()).map(Vec::len),
            Some(1)
        );
    }
}
