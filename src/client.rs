//! Connection routing client.
//!
//! Given a target address, chooses the best scanner path that can reach it,
//! consumes a connection slot where the path is a local adapter, loads fast
//! connection parameters over the MGMT channel and hands off to the backend
//! that performs the actual connection.

use std::sync::{Arc, RwLock};

use crate::{
    central::get_manager,
    device::{BleDevice, ClientFactory, GattClient, ScannerDevice},
    mgmt::ConnectParams,
    scanner::Scanner,
    Address, Error, ErrorKind, Manager, Result,
};

lazy_static::lazy_static! {
    static ref PLATFORM_CLIENT_FACTORY: RwLock<Option<Arc<dyn ClientFactory>>> = RwLock::new(None);
}

/// Set the backend factory used for devices seen by local adapters.
pub fn set_platform_client_factory(factory: Arc<dyn ClientFactory>) {
    *PLATFORM_CLIENT_FACTORY.write().unwrap() = Some(factory);
}

fn platform_client_factory() -> Option<Arc<dyn ClientFactory>> {
    PLATFORM_CLIENT_FACTORY.read().unwrap().clone()
}

struct ResolvedBackend {
    device: BleDevice,
    scanner: Scanner,
    factory: Arc<dyn ClientFactory>,
    /// Adapter a connection slot was taken on, for local paths.
    slot_adapter: Option<String>,
}

/// GATT client that routes its connection over the best scanner path.
pub struct BleClient {
    manager: Manager,
    address: Address,
    backend: Option<Box<dyn GattClient>>,
    slot_adapter: Option<String>,
}

impl std::fmt::Debug for BleClient {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BleClient")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Releases connect-window state unless the attempt completed.
struct ConnectAttempt<'a> {
    manager: &'a Manager,
    scanner: &'a Scanner,
    address: Address,
    slot_adapter: Option<&'a str>,
    completed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Runs on error and on cancellation alike.
        self.scanner.finished_connecting(self.address, false);
        if let Some(adapter) = self.slot_adapter {
            self.manager.release_connection_slot(adapter, self.address);
        }
    }
}

impl BleClient {
    /// Creates a client for the address using the process-wide manager.
    pub fn new(address: Address) -> Self {
        Self::with_manager(get_manager(), address)
    }

    /// Creates a client for the address using the given manager.
    pub fn with_manager(manager: Manager, address: Address) -> Self {
        Self { manager, address, backend: None, slot_adapter: None }
    }

    /// Target address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether the client currently holds an open connection.
    pub fn is_connected(&self) -> bool {
        self.backend.as_ref().map(|backend| backend.is_connected()).unwrap_or(false)
    }

    /// Connect to the device over the best available scanner path.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if self.manager.is_shutdown() {
            return Err(Error::with_message(ErrorKind::Shutdown, "bluetooth is already shutdown"));
        }

        log::debug!("{}: Looking for backend to connect", self.address);
        let resolved = self.best_available_backend_and_device()?;
        let scanner = resolved.scanner;
        let device = resolved.device;
        let mut backend = resolved.factory.client(&device);

        // Load fast connection parameters before connecting when the path is
        // a local adapter reachable over the MGMT channel.
        self.load_conn_params(&scanner, &device, ConnectParams::Fast);

        scanner.add_connecting(self.address);
        let mut attempt = ConnectAttempt {
            manager: &self.manager,
            scanner: &scanner,
            address: self.address,
            slot_adapter: resolved.slot_adapter.as_deref(),
            completed: false,
        };
        log::debug!(
            "{}: Connecting via {} [{}]",
            device,
            scanner.name(),
            resolved.factory.backend_name()
        );
        if let Err(err) = backend.connect().await {
            log::debug!("{}: Failed to connect via {}: {err}", device, scanner.name());
            return Err(err);
        }
        attempt.completed = true;
        drop(attempt);
        scanner.finished_connecting(self.address, true);

        self.backend = Some(backend);
        self.slot_adapter = resolved.slot_adapter;

        // Relax the connection parameters now that the link is up.
        self.load_conn_params(&scanner, &device, ConnectParams::Medium);
        log::debug!("{}: Connected via {}", device, scanner.name());
        Ok(())
    }

    /// Disconnect from the device and release all routing state.
    pub async fn disconnect(&mut self) -> Result<()> {
        let result = match self.backend.as_mut() {
            Some(backend) => backend.disconnect().await,
            None => Ok(()),
        };
        self.backend = None;
        if let Some(adapter) = self.slot_adapter.take() {
            self.manager.release_connection_slot(&adapter, self.address);
        }
        result
    }

    fn load_conn_params(&self, scanner: &Scanner, device: &BleDevice, params: ConnectParams) {
        let Some(adapter_idx) = scanner.adapter_idx() else { return };
        let Some(mgmt) = self.manager.mgmt_channel() else { return };
        if mgmt.load_conn_params(adapter_idx, device.address, device.address_type, params) {
            log::debug!("{}: Loaded {params} connection parameters", device);
        }
    }

    /// Get the best available backend and device for the address.
    ///
    /// Candidate paths are ordered by score; the first one that yields a
    /// backend wins. A local path must obtain a connection slot, a proxy path
    /// must pass its connector's `can_connect` gate.
    fn best_available_backend_and_device(&self) -> Result<ResolvedBackend> {
        let mut sorted_devices = self.manager.scanner_devices_by_address(&self.address, true);
        sorted_devices.sort_by_key(|device| std::cmp::Reverse(device.advertisement.rssi));

        let mut rssi_diff = 0;
        if sorted_devices.len() > 1 {
            rssi_diff = sorted_devices[0].advertisement.rssi - sorted_devices[1].advertisement.rssi;
            sorted_devices.sort_by(|a, b| {
                b.score_connection_path(rssi_diff)
                    .total_cmp(&a.score_connection_path(rssi_diff))
                    .then_with(|| {
                        a.scanner
                            .connections_in_progress()
                            .cmp(&b.scanner.connections_in_progress())
                    })
                    .then_with(|| {
                        a.scanner
                            .connection_failures(&self.address)
                            .cmp(&b.scanner.connection_failures(&self.address))
                    })
            });
        }

        if !sorted_devices.is_empty() && log::log_enabled!(log::Level::Info) {
            let order: Vec<String> = sorted_devices
                .iter()
                .map(|device| {
                    let slots = device
                        .scanner
                        .get_allocations()
                        .map(|allocations| {
                            format!("(slots={}/{} free) ", allocations.free, allocations.slots)
                        })
                        .unwrap_or_default();
                    format!(
                        "{} (RSSI={}) (failures={}) (in_progress={}) {}(score={})",
                        device.scanner.name(),
                        device.advertisement.rssi,
                        device.scanner.connection_failures(&self.address),
                        device.scanner.connections_in_progress(),
                        slots,
                        device.score_connection_path(rssi_diff)
                    )
                })
                .collect();
            log::info!(
                "{}: Found {} connection path(s), preferred order: {}",
                self.address,
                sorted_devices.len(),
                order.join(", ")
            );
        }

        for candidate in sorted_devices {
            if let Some(resolved) = self.backend_for_ble_device(candidate) {
                return Ok(resolved);
            }
        }

        // Distinguish a fabric with no connectable adapters at all from one
        // that is merely out of capacity.
        let scanners = self.manager.current_scanners();
        if !scanners.is_empty() && !scanners.iter().any(Scanner::connectable) {
            let scanner_names: Vec<&str> = scanners.iter().map(Scanner::name).collect();
            return Err(Error::with_message(
                ErrorKind::NoConnectableAdapters,
                format!(
                    "{}: all registered scanners are passive-only; available: {}",
                    self.address,
                    scanner_names.join(", ")
                ),
            ));
        }
        Err(Error::with_message(
            ErrorKind::NoConnectionSlot,
            format!(
                "no backend with an available connection slot that can reach address {}",
                self.address
            ),
        ))
    }

    fn backend_for_ble_device(&self, candidate: ScannerDevice) -> Option<ResolvedBackend> {
        let ScannerDevice { scanner, device, .. } = candidate;
        if device.source.is_none() {
            // The device was seen by a local adapter; its backend is the
            // platform client and a connection slot is required.
            let factory = platform_client_factory()?;
            if !self.manager.allocate_connection_slot(scanner.adapter(), self.address) {
                return None;
            }
            let slot_adapter = Some(scanner.adapter().to_string());
            return Some(ResolvedBackend { device, scanner, factory, slot_adapter });
        }

        // Make sure the proxy backend can take another connection, as some
        // backends have connection limits of their own.
        let connector = scanner.connector()?;
        if !(connector.can_connect)() {
            return None;
        }
        let factory = connector.factory.clone();
        Some(ResolvedBackend { device, scanner, factory, slot_adapter: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::Connector,
        scanner::{LocalScanner, RemoteScanner},
        ErrorKind,
    };
    use futures::future::BoxFuture;

    /// Backend that fails for addresses ending in 99.
    struct FakeClient {
        address: Address,
        connected: bool,
    }

    impl GattClient for FakeClient {
        fn connect(&mut self) -> BoxFuture<'_, crate::Result<()>> {
            Box::pin(async move {
                tokio::task::yield_now().await;
                if self.address.0[5] == 99 {
                    return Err(Error::with_message(
                        ErrorKind::ConnectionAttemptFailed,
                        "refused by test backend",
                    ));
                }
                self.connected = true;
                Ok(())
            })
        }

        fn disconnect(&mut self) -> BoxFuture<'_, crate::Result<()>> {
            Box::pin(async move {
                self.connected = false;
                Ok(())
            })
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }

    struct FakeFactory;

    impl ClientFactory for FakeFactory {
        fn backend_name(&self) -> &str {
            "fake"
        }

        fn client(&self, device: &BleDevice) -> Box<dyn GattClient> {
            Box::new(FakeClient { address: device.address, connected: false })
        }
    }

    fn local_scanner(manager: &Manager, idx: u16, source: &str) -> LocalScanner {
        LocalScanner::new(
            source,
            format!("hci{idx}"),
            idx,
            Address::any(),
            manager.advertisement_sink(),
            None,
            None,
        )
    }

    fn a(n: u8) -> Address {
        Address::new([0, 0, 0, 0, 0, n])
    }

    #[tokio::test]
    async fn thundering_herd_respects_slots() {
        set_platform_client_factory(Arc::new(FakeFactory));
        let manager = Manager::builder().build();
        let good1 = local_scanner(&manager, 0, "s-good1");
        let good2 = local_scanner(&manager, 1, "s-good2");
        let bad = local_scanner(&manager, 2, "s-bad");
        let _reg1 = manager.register_scanner(good1.as_scanner(), Some(3));
        let _reg2 = manager.register_scanner(good2.as_scanner(), Some(3));
        let _reg3 = manager.register_scanner(bad.as_scanner(), Some(3));

        for n in 1..=7 {
            for (scanner, rssi) in [(&good1, -60), (&good2, -65), (&bad, -80)] {
                scanner.on_raw_advertisement(a(n), 1, rssi, 0, &[]);
            }
        }

        let mut tasks = Vec::new();
        for n in 1..=7 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                let mut client = BleClient::with_manager(manager, a(n));
                client.connect().await.map(|_| client)
            }));
        }
        let clients: Vec<BleClient> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|joined| joined.unwrap().unwrap())
            .collect();

        let good1_allocations = manager.slot_manager().get_allocations("hci0").unwrap();
        let good2_allocations = manager.slot_manager().get_allocations("hci1").unwrap();
        let bad_allocations = manager.slot_manager().get_allocations("hci2").unwrap();
        assert_eq!(good1_allocations.allocated.len(), 3);
        assert_eq!(good1_allocations.free, 0);
        assert_eq!(good2_allocations.allocated.len(), 3);
        assert_eq!(good2_allocations.free, 0);
        assert_eq!(bad_allocations.allocated.len(), 1);
        assert_eq!(bad_allocations.free, 2);

        for scanner in [&good1, &good2, &bad] {
            let scanner = scanner.as_scanner();
            assert_eq!(scanner.connections_in_progress(), 0);
            for n in 1..=7 {
                assert_eq!(scanner.connection_failures(&a(n)), 0);
            }
        }
        drop(clients);
    }

    #[tokio::test]
    async fn passive_only_fabric_reports_no_connectable_adapters() {
        let manager = Manager::builder().build();
        let passive =
            RemoteScanner::new("passive-proxy", "passive-proxy", manager.advertisement_sink(), None, false);
        let _reg = manager.register_scanner(passive.as_scanner(), None);
        passive.on_advertisement(
            a(1),
            -60,
            None,
            Default::default(),
            Default::default(),
            Default::default(),
            None,
            1.0,
        );

        let mut client = BleClient::with_manager(manager, a(1));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoConnectableAdapters);
        assert!(err.message.contains("passive-proxy"));
    }

    #[tokio::test]
    async fn exhausted_slots_report_no_connection_slot() {
        set_platform_client_factory(Arc::new(FakeFactory));
        let manager = Manager::builder().build();
        let scanner = local_scanner(&manager, 0, "s-local");
        let _reg = manager.register_scanner(scanner.as_scanner(), Some(0));
        scanner.on_raw_advertisement(a(1), 1, -60, 0, &[]);

        let mut client = BleClient::with_manager(manager, a(1));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoConnectionSlot);
        assert!(err.message.contains(&a(1).to_string()));
    }

    #[tokio::test]
    async fn connector_gate_is_respected() {
        let manager = Manager::builder().build();
        let connector = Connector {
            source: "proxy".into(),
            can_connect: Arc::new(|| false),
            factory: Arc::new(FakeFactory),
        };
        let proxy = RemoteScanner::new(
            "proxy",
            "proxy",
            manager.advertisement_sink(),
            Some(connector),
            true,
        );
        let _reg = manager.register_scanner(proxy.as_scanner(), None);
        proxy.on_advertisement(
            a(1),
            -60,
            None,
            Default::default(),
            Default::default(),
            Default::default(),
            None,
            1.0,
        );

        let mut client = BleClient::with_manager(manager.clone(), a(1));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoConnectionSlot);
    }

    #[tokio::test]
    async fn connector_path_connects_without_slot() {
        let manager = Manager::builder().build();
        let connector = Connector {
            source: "proxy".into(),
            can_connect: Arc::new(|| true),
            factory: Arc::new(FakeFactory),
        };
        let proxy = RemoteScanner::new(
            "proxy",
            "proxy",
            manager.advertisement_sink(),
            Some(connector),
            true,
        );
        let _reg = manager.register_scanner(proxy.as_scanner(), None);
        proxy.on_advertisement(
            a(1),
            -60,
            None,
            Default::default(),
            Default::default(),
            Default::default(),
            None,
            1.0,
        );

        let mut client = BleClient::with_manager(manager.clone(), a(1));
        client.connect().await.unwrap();
        assert!(client.is_connected());
        // Short-circuit when already connected.
        client.connect().await.unwrap();
        client.disconnect().await.unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn failed_connect_releases_slot_and_counts_failure() {
        set_platform_client_factory(Arc::new(FakeFactory));
        let manager = Manager::builder().build();
        let scanner = local_scanner(&manager, 0, "s-local");
        let _reg = manager.register_scanner(scanner.as_scanner(), Some(1));
        scanner.on_raw_advertisement(a(99), 1, -60, 0, &[]);

        let mut client = BleClient::with_manager(manager.clone(), a(99));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionAttemptFailed);

        let allocations = manager.slot_manager().get_allocations("hci0").unwrap();
        assert_eq!(allocations.free, 1);
        let scanner = scanner.as_scanner();
        assert_eq!(scanner.connection_failures(&a(99)), 1);
        assert_eq!(scanner.connections_in_progress(), 0);
        assert!(scanner.scanning());
    }

    #[tokio::test]
    async fn disconnect_releases_slot() {
        set_platform_client_factory(Arc::new(FakeFactory));
        let manager = Manager::builder().build();
        let scanner = local_scanner(&manager, 0, "s-local");
        let _reg = manager.register_scanner(scanner.as_scanner(), Some(1));
        scanner.on_raw_advertisement(a(7), 1, -60, 0, &[]);

        let mut client = BleClient::with_manager(manager.clone(), a(7));
        client.connect().await.unwrap();
        assert_eq!(manager.slot_manager().get_allocations("hci0").unwrap().free, 0);

        client.disconnect().await.unwrap();
        assert_eq!(manager.slot_manager().get_allocations("hci0").unwrap().free, 1);
        assert_eq!(scanner.as_scanner().connection_failures(&a(7)), 0);
    }

    #[tokio::test]
    async fn connect_after_shutdown_fails() {
        let manager = Manager::builder().build();
        manager.stop();
        let mut client = BleClient::with_manager(manager, a(1));
        let err = client.connect().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Shutdown);
    }
}
