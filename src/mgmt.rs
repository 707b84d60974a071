//! Bluetooth management channel.
//!
//! Framed little-endian binary protocol client for the kernel Bluetooth
//! management (MGMT) socket. Inbound advertisement frames are dispatched to
//! the [local scanner](crate::LocalScanner) registered for their controller
//! index; outbound commands are correlated with their responses by opcode.

use std::{
    collections::HashMap,
    io,
    mem::size_of,
    os::unix::io::{AsRawFd, RawFd},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use strum::Display;
use tokio::{
    io::unix::AsyncFd,
    sync::{oneshot, Notify},
    task::JoinHandle,
};

use crate::{scanner::LocalScanner, sys, Address, AddressType, Error, ErrorKind, Result};

/// Read-only command used as a capability probe.
pub const MGMT_OP_GET_CONNECTIONS: u16 = 0x0015;
/// Loads connection parameters for a device.
pub const MGMT_OP_LOAD_CONN_PARAM: u16 = 0x0035;

const MGMT_EV_CMD_COMPLETE: u16 = 0x0001;
const MGMT_EV_CMD_STATUS: u16 = 0x0002;
const MGMT_EV_DEVICE_FOUND: u16 = 0x0012;
const MGMT_EV_ADV_MONITOR_DEVICE_FOUND: u16 = 0x002F;

const MGMT_STATUS_SUCCESS: u8 = 0x00;
const MGMT_STATUS_INVALID_INDEX: u8 = 0x11;
const MGMT_STATUS_PERMISSION_DENIED: u8 = 0x14;

/// Header is event_code (2 bytes), controller_idx (2 bytes), param_len (2 bytes).
const HEADER_SIZE: usize = 6;

const CAPABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Fast connection parameters used while establishing a connection.
pub const FAST_MIN_CONN_INTERVAL: u16 = 6;
/// See [FAST_MIN_CONN_INTERVAL].
pub const FAST_MAX_CONN_INTERVAL: u16 = 12;
/// See [FAST_MIN_CONN_INTERVAL].
pub const FAST_CONN_LATENCY: u16 = 0;
/// See [FAST_MIN_CONN_INTERVAL].
pub const FAST_CONN_TIMEOUT: u16 = 500;

/// Medium connection parameters loaded once a connection is established.
pub const MEDIUM_MIN_CONN_INTERVAL: u16 = 24;
/// See [MEDIUM_MIN_CONN_INTERVAL].
pub const MEDIUM_MAX_CONN_INTERVAL: u16 = 40;
/// See [MEDIUM_MIN_CONN_INTERVAL].
pub const MEDIUM_CONN_LATENCY: u16 = 0;
/// See [MEDIUM_MIN_CONN_INTERVAL].
pub const MEDIUM_CONN_TIMEOUT: u16 = 500;

/// Connection parameter preset.
///
/// Intervals are in units of 1.25 ms, the timeout in units of 10 ms.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
pub enum ConnectParams {
    /// Short intervals for fast connection establishment.
    #[strum(serialize = "fast")]
    Fast,
    /// Relaxed intervals for an established connection.
    #[strum(serialize = "medium")]
    Medium,
}

impl ConnectParams {
    fn values(self) -> (u16, u16, u16, u16) {
        match self {
            Self::Fast => {
                (FAST_MIN_CONN_INTERVAL, FAST_MAX_CONN_INTERVAL, FAST_CONN_LATENCY, FAST_CONN_TIMEOUT)
            }
            Self::Medium => (
                MEDIUM_MIN_CONN_INTERVAL,
                MEDIUM_MAX_CONN_INTERVAL,
                MEDIUM_CONN_LATENCY,
                MEDIUM_CONN_TIMEOUT,
            ),
        }
    }
}

/// One parsed MGMT frame.
#[derive(Debug, Clone, Eq, PartialEq)]
struct Frame {
    event_code: u16,
    controller_idx: u16,
    params: Vec<u8>,
}

/// Accumulates received bytes and yields complete frames.
///
/// Parsing is idempotent under byte splitting: feeding a byte sequence in any
/// partition yields the same frames as feeding it whole.
#[derive(Debug, Default)]
struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < HEADER_SIZE {
            return None;
        }
        let event_code = u16::from_le_bytes([self.buffer[0], self.buffer[1]]);
        let controller_idx = u16::from_le_bytes([self.buffer[2], self.buffer[3]]);
        let param_len = usize::from(u16::from_le_bytes([self.buffer[4], self.buffer[5]]));
        if self.buffer.len() < HEADER_SIZE + param_len {
            return None;
        }
        let params = self.buffer[HEADER_SIZE..HEADER_SIZE + param_len].to_vec();
        self.buffer.drain(..HEADER_SIZE + param_len);
        Some(Frame { event_code, controller_idx, params })
    }
}

/// Ingress event the channel reacts to.
#[derive(Debug, Clone, Eq, PartialEq)]
enum MgmtEvent {
    DeviceFound { controller_idx: u16, address: Address, address_type: u8, rssi: i16, flags: u32, data: Vec<u8> },
    CommandComplete { opcode: u16, status: u8, params: Vec<u8> },
    CommandStatus { opcode: u16, status: u8 },
}

fn parse_frame(frame: &Frame) -> Option<MgmtEvent> {
    match frame.event_code {
        MGMT_EV_DEVICE_FOUND => parse_device_found(frame, 0),
        // Skip the 2-byte monitor handle.
        MGMT_EV_ADV_MONITOR_DEVICE_FOUND => parse_device_found(frame, 2),
        MGMT_EV_CMD_COMPLETE => {
            let params = &frame.params;
            if params.len() < 3 {
                return None;
            }
            Some(MgmtEvent::CommandComplete {
                opcode: u16::from_le_bytes([params[0], params[1]]),
                status: params[2],
                params: params[3..].to_vec(),
            })
        }
        MGMT_EV_CMD_STATUS => {
            let params = &frame.params;
            if params.len() < 3 {
                return None;
            }
            Some(MgmtEvent::CommandStatus {
                opcode: u16::from_le_bytes([params[0], params[1]]),
                status: params[2],
            })
        }
        _ => None,
    }
}

fn parse_device_found(frame: &Frame, offset: usize) -> Option<MgmtEvent> {
    let params = &frame.params;
    if params.len() < offset + 14 {
        return None;
    }
    let mut bdaddr = sys::bdaddr_t { b: [0; 6] };
    bdaddr.b.copy_from_slice(&params[offset..offset + 6]);
    let address_type = params[offset + 6];
    let mut rssi = i16::from(params[offset + 7]);
    if rssi > 127 {
        rssi -= 256;
    }
    let flags = u32::from_le_bytes([
        params[offset + 8],
        params[offset + 9],
        params[offset + 10],
        params[offset + 11],
    ]);
    // Skip AD_Data_Length (2 bytes); the remaining params are the AD payload.
    Some(MgmtEvent::DeviceFound {
        controller_idx: frame.controller_idx,
        address: bdaddr.into(),
        address_type,
        rssi,
        flags,
        data: params[offset + 14..].to_vec(),
    })
}

/// Write half of the management transport.
pub(crate) trait MgmtIo: Send + Sync {
    /// Write one command as a single message.
    fn send(&self, frame: &[u8]) -> io::Result<usize>;
}

/// File descriptor of the management control channel.
///
/// The socket is message oriented: one `send` per command, one header plus
/// payload per receive. Closed on drop.
#[derive(Debug)]
struct MgmtFd {
    fd: RawFd,
}

impl MgmtFd {
    /// Opens the non-blocking control channel, bound to no particular
    /// adapter so events from all controllers arrive here.
    fn open() -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                sys::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                sys::BTPROTO_HCI,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let fd = Self { fd };
        let addr = sys::sockaddr_hci {
            hci_family: sys::AF_BLUETOOTH as _,
            hci_dev: sys::HCI_DEV_NONE,
            hci_channel: sys::HCI_CHANNEL_CONTROL,
        };
        if unsafe {
            libc::bind(
                fd.fd,
                &addr as *const _ as *const libc::sockaddr,
                size_of::<sys::sockaddr_hci>() as libc::socklen_t,
            )
        } == -1
        {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        match unsafe { libc::send(self.fd, frame.as_ptr() as *const _, frame.len(), 0) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as _),
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut _, buf.len(), 0) } {
            -1 => Err(io::Error::last_os_error()),
            n => Ok(n as _),
        }
    }
}

impl AsRawFd for MgmtFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for MgmtFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Management control socket with tokio readiness.
struct MgmtSocket {
    fd: AsyncFd<MgmtFd>,
}

impl MgmtSocket {
    fn open() -> io::Result<Self> {
        Ok(Self { fd: AsyncFd::new(MgmtFd::open()?)? })
    }

    async fn writable(&self) -> io::Result<()> {
        self.fd.writable().await?.retain_ready();
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| inner.get_ref().recv(buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl MgmtIo for MgmtSocket {
    fn send(&self, frame: &[u8]) -> io::Result<usize> {
        self.fd.get_ref().send(frame)
    }
}

/// Client for the kernel Bluetooth management socket.
///
/// Receives raw advertisement frames and dispatches them to the matching
/// scanner, and sends commands with correlated responses on behalf of
/// outbound GATT connections. The connection is supervised: once set up, a
/// lost connection is re-established with a 1 s backoff until
/// [close](Self::close) is called.
#[derive(Clone)]
pub struct MgmtChannel {
    inner: Arc<MgmtChannelInner>,
}

struct MgmtChannelInner {
    timeout: Duration,
    scanners: Mutex<HashMap<u16, LocalScanner>>,
    io: Mutex<Option<Arc<dyn MgmtIo>>>,
    buffer: Mutex<FrameBuffer>,
    pending: Mutex<HashMap<u16, oneshot::Sender<(u8, Vec<u8>)>>>,
    shutting_down: AtomicBool,
    connection_lost: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MgmtChannel {
    /// Creates an unconnected channel.
    ///
    /// `timeout` bounds how long establishing the transport may take.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(MgmtChannelInner {
                timeout,
                scanners: Mutex::new(HashMap::new()),
                io: Mutex::new(None),
                buffer: Mutex::new(FrameBuffer::default()),
                pending: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
                connection_lost: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register the scanner receiving advertisement frames for a controller.
    pub fn register_scanner(&self, controller_idx: u16, scanner: LocalScanner) {
        self.inner.scanners.lock().unwrap().insert(controller_idx, scanner);
    }

    /// Remove the scanner for a controller.
    pub fn unregister_scanner(&self, controller_idx: u16) {
        self.inner.scanners.lock().unwrap().remove(&controller_idx);
    }

    /// Set up the management interface.
    ///
    /// Opens the socket, probes whether the process has the capabilities to
    /// use the management interface and spawns the reconnect supervisor.
    /// Fails with [ErrorKind::PermissionDenied] when the probe is refused or
    /// does not answer; no reconnection is attempted in that case.
    pub async fn setup(&self) -> Result<()> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::Shutdown));
        }
        self.establish_connection().await?;
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.drop_transport();
            return Err(Error::with_message(ErrorKind::Aborted, "closed while setting up"));
        }
        self.finish_setup().await
    }

    async fn finish_setup(&self) -> Result<()> {
        if !self.check_capabilities().await {
            // Mark as shutting down to prevent reconnection attempts.
            self.inner.shutting_down.store(true, Ordering::SeqCst);
            self.drop_transport();
            return Err(Error::with_message(
                ErrorKind::PermissionDenied,
                "missing NET_ADMIN/NET_RAW capabilities for Bluetooth management",
            ));
        }

        if self.inner.shutting_down.load(Ordering::SeqCst) {
            self.drop_transport();
            return Err(Error::with_message(ErrorKind::Aborted, "closed while setting up"));
        }

        let channel = self.downgrade();
        let task = tokio::spawn(async move {
            MgmtChannel::reconnect_task(channel).await;
        });
        self.inner.tasks.lock().unwrap().push(task);
        Ok(())
    }

    /// Close the management interface.
    ///
    /// Idempotent. Pending command responses are abandoned.
    pub fn close(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        self.drop_transport();
        self.inner.pending.lock().unwrap().clear();
    }

    /// Whether the transport is currently connected.
    pub fn is_connected(&self) -> bool {
        self.inner.io.lock().unwrap().is_some()
    }

    fn drop_transport(&self) {
        *self.inner.io.lock().unwrap() = None;
    }

    fn downgrade(&self) -> Weak<MgmtChannelInner> {
        Arc::downgrade(&self.inner)
    }

    async fn establish_connection(&self) -> Result<()> {
        log::debug!("Establishing Bluetooth management socket connection");
        let socket = Arc::new(MgmtSocket::open().map_err(|err| {
            Error::with_message(ErrorKind::TransportSetupFailed, err.to_string())
        })?);

        tokio::time::timeout(self.inner.timeout, socket.writable())
            .await
            .map_err(|_| {
                Error::with_message(
                    ErrorKind::TransportSetupFailed,
                    "timeout waiting for management socket connection",
                )
            })?
            .map_err(|err| Error::with_message(ErrorKind::TransportSetupFailed, err.to_string()))?;

        *self.inner.io.lock().unwrap() = Some(socket.clone());
        *self.inner.buffer.lock().unwrap() = FrameBuffer::default();

        let channel = self.downgrade();
        let task = tokio::spawn(async move {
            let mut buf = vec![0; 2048];
            loop {
                let received = socket.recv(&mut buf).await;
                let Some(inner) = channel.upgrade() else { break };
                let channel = MgmtChannel { inner };
                match received {
                    Ok(0) | Err(_) => {
                        channel.on_connection_lost(received.err());
                        break;
                    }
                    Ok(n) => channel.data_received(&buf[..n]),
                }
            }
        });
        self.inner.tasks.lock().unwrap().push(task);
        log::debug!("Bluetooth management socket connection established");
        Ok(())
    }

    fn on_connection_lost(&self, err: Option<io::Error>) {
        if let Some(err) = err {
            log::warn!("Bluetooth management socket connection lost: {err}");
        }
        self.drop_transport();
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            log::debug!("Bluetooth management socket connection lost during shutdown");
        } else {
            log::debug!("Bluetooth management socket connection lost, reconnecting");
            self.inner.connection_lost.notify_one();
        }
    }

    /// Monitor the connection and reconnect when it is lost.
    async fn reconnect_task(channel: Weak<MgmtChannelInner>) {
        loop {
            {
                let Some(inner) = channel.upgrade() else { return };
                if inner.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                inner.connection_lost.notified().await;
            }
            loop {
                let Some(inner) = channel.upgrade() else { return };
                if inner.shutting_down.load(Ordering::SeqCst) {
                    return;
                }
                let channel = MgmtChannel { inner };
                log::debug!("Reconnecting to Bluetooth management socket");
                match channel.establish_connection().await {
                    Ok(()) => break,
                    Err(err) => {
                        log::debug!("Bluetooth management socket reconnect failed: {err}");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
    }

    /// Feed received bytes into the frame buffer and dispatch complete frames.
    fn data_received(&self, data: &[u8]) {
        let mut events = Vec::new();
        {
            let mut buffer = self.inner.buffer.lock().unwrap();
            buffer.extend(data);
            while let Some(frame) = buffer.next_frame() {
                if let Some(event) = parse_frame(&frame) {
                    events.push(event);
                }
            }
        }
        for event in events {
            self.handle_event(event);
        }
    }

    fn handle_event(&self, event: MgmtEvent) {
        match event {
            MgmtEvent::DeviceFound { controller_idx, address, address_type, rssi, flags, data } => {
                let scanner = self.inner.scanners.lock().unwrap().get(&controller_idx).cloned();
                if let Some(scanner) = scanner {
                    scanner.on_raw_advertisement(address, address_type, rssi, flags, &data);
                }
            }
            MgmtEvent::CommandComplete { opcode, status, params } => {
                self.resolve_response(opcode, status, params);
            }
            MgmtEvent::CommandStatus { opcode, status } => {
                self.resolve_response(opcode, status, Vec::new());
            }
        }
    }

    fn resolve_response(&self, opcode: u16, status: u8, params: Vec<u8>) {
        let pending = self.inner.pending.lock().unwrap().remove(&opcode);
        match pending {
            Some(tx) => {
                let _ = tx.send((status, params));
            }
            None => log::debug!("Unsolicited response for opcode {opcode:#06x} dropped"),
        }
    }

    /// Register a pending response future for an opcode.
    ///
    /// Only one in-flight request per opcode is supported; callers enforce
    /// any higher concurrency by their own queuing.
    fn setup_command_response(&self, opcode: u16) -> oneshot::Receiver<(u8, Vec<u8>)> {
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().unwrap().insert(opcode, tx);
        rx
    }

    fn cleanup_command_response(&self, opcode: u16) {
        self.inner.pending.lock().unwrap().remove(&opcode);
    }

    fn send_command(&self, opcode: u16, controller_idx: u16, body: &[u8]) -> io::Result<()> {
        let io = self.inner.io.lock().unwrap().clone();
        let Some(io) = io else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "no management connection"));
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&opcode.to_le_bytes());
        frame.extend_from_slice(&controller_idx.to_le_bytes());
        frame.extend_from_slice(&(body.len() as u16).to_le_bytes());
        frame.extend_from_slice(body);
        // The management socket may report 0 on success; treat it as sent.
        if io.send(&frame)? == 0 {
            log::debug!("Management socket send returned 0, treating as success");
        }
        Ok(())
    }

    /// Check if we have the necessary capabilities to use MGMT.
    ///
    /// GET_CONNECTIONS for controller 0 is a read-only command that requires
    /// the management privileges but does not change any state. An adapter
    /// that does not exist still answers with invalid index, which proves the
    /// privileges are present.
    async fn check_capabilities(&self) -> bool {
        let response = self.setup_command_response(MGMT_OP_GET_CONNECTIONS);
        let result = async {
            self.send_command(MGMT_OP_GET_CONNECTIONS, 0, &[])?;
            match tokio::time::timeout(CAPABILITY_PROBE_TIMEOUT, response).await {
                Ok(Ok((status, _params))) => Ok(status),
                Ok(Err(_)) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")),
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "probe timed out")),
            }
        }
        .await;
        self.cleanup_command_response(MGMT_OP_GET_CONNECTIONS);
        match result {
            Ok(status) => has_capabilities_from_status(status),
            Err(err) => {
                log::debug!(
                    "MGMT capability check failed: {err} - likely missing NET_ADMIN/NET_RAW"
                );
                false
            }
        }
    }

    /// Load connection parameters for a device.
    ///
    /// Returns whether the command was sent.
    pub fn load_conn_params(
        &self, adapter_idx: u16, address: Address, address_type: AddressType, params: ConnectParams,
    ) -> bool {
        let (min_interval, max_interval, latency, timeout) = params.values();
        let bdaddr: sys::bdaddr_t = address.into();
        let mut body = Vec::with_capacity(17);
        body.extend_from_slice(&1u16.to_le_bytes()); // param_count
        body.extend_from_slice(&bdaddr.b);
        body.push(address_type as u8);
        body.extend_from_slice(&min_interval.to_le_bytes());
        body.extend_from_slice(&max_interval.to_le_bytes());
        body.extend_from_slice(&latency.to_le_bytes());
        body.extend_from_slice(&timeout.to_le_bytes());

        match self.send_command(MGMT_OP_LOAD_CONN_PARAM, adapter_idx, &body) {
            Ok(()) => {
                log::debug!(
                    "Loaded conn params for {address}: interval={min_interval}-{max_interval}, latency={latency}, timeout={timeout}"
                );
                true
            }
            Err(err) => {
                log::warn!("Failed to load conn params for {address}: {err}");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn install_io_for_test(&self, io: Arc<dyn MgmtIo>) {
        *self.inner.io.lock().unwrap() = Some(io);
    }

    #[cfg(test)]
    pub(crate) fn reconnect_task_count(&self) -> usize {
        self.inner.tasks.lock().unwrap().len()
    }
}

/// Decide capabilities by the status of the probe command.
///
/// Success and invalid index both prove the privileges are present; a
/// permission denial or anything unexpected is treated as missing privileges.
fn has_capabilities_from_status(status: u8) -> bool {
    match status {
        MGMT_STATUS_PERMISSION_DENIED => {
            log::debug!(
                "MGMT capability check failed with permission denied - missing NET_ADMIN/NET_RAW"
            );
            false
        }
        MGMT_STATUS_SUCCESS | MGMT_STATUS_INVALID_INDEX => {
            log::debug!("MGMT capability check passed (status: {status:#x})");
            true
        }
        status => {
            log::debug!(
                "MGMT capability check returned unexpected status {status:#x} - assuming missing permissions"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{device::ServiceInfo, scanner::AdvertisementSink};
    use std::sync::Mutex as StdMutex;

    struct MockIo {
        sent: StdMutex<Vec<Vec<u8>>>,
        result: fn(&[u8]) -> io::Result<usize>,
    }

    impl MockIo {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: StdMutex::new(Vec::new()), result: |frame| Ok(frame.len()) })
        }

        fn returning_zero() -> Arc<Self> {
            Arc::new(Self { sent: StdMutex::new(Vec::new()), result: |_| Ok(0) })
        }
    }

    impl MgmtIo for MockIo {
        fn send(&self, frame: &[u8]) -> io::Result<usize> {
            self.sent.lock().unwrap().push(frame.to_vec());
            (self.result)(frame)
        }
    }

    fn frame_bytes(event_code: u16, controller_idx: u16, params: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&event_code.to_le_bytes());
        bytes.extend_from_slice(&controller_idx.to_le_bytes());
        bytes.extend_from_slice(&(params.len() as u16).to_le_bytes());
        bytes.extend_from_slice(params);
        bytes
    }

    fn device_found_params(address: &str, rssi_raw: u8, flags: u32, ad_data: &[u8]) -> Vec<u8> {
        let address: Address = address.parse().unwrap();
        let bdaddr: sys::bdaddr_t = address.into();
        let mut params = Vec::new();
        params.extend_from_slice(&bdaddr.b);
        params.push(1); // public
        params.push(rssi_raw);
        params.extend_from_slice(&flags.to_le_bytes());
        params.extend_from_slice(&(ad_data.len() as u16).to_le_bytes());
        params.extend_from_slice(ad_data);
        params
    }

    fn collecting_scanner(controller_idx: u16, channel: &MgmtChannel) -> Arc<StdMutex<Vec<ServiceInfo>>> {
        let collected = Arc::new(StdMutex::new(Vec::new()));
        let sink_collected = collected.clone();
        let sink: AdvertisementSink = Arc::new(move |info| {
            sink_collected.lock().unwrap().push(info);
        });
        let scanner = LocalScanner::new(
            "aa:bb:cc:dd:ee:ff",
            "hci0",
            controller_idx,
            "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            sink,
            None,
            None,
        );
        channel.register_scanner(controller_idx, scanner);
        collected
    }

    #[test]
    fn frame_buffer_split_is_idempotent() {
        let params = device_found_params("11:22:33:44:55:66", 0xB8, 0, &[0x02, 0x01, 0x06]);
        let mut bytes = frame_bytes(MGMT_EV_DEVICE_FOUND, 0, &params);
        bytes.extend(frame_bytes(MGMT_EV_CMD_STATUS, 0, &[0x35, 0x00, 0x00]));

        let mut whole = FrameBuffer::default();
        whole.extend(&bytes);
        let mut expected = Vec::new();
        while let Some(frame) = whole.next_frame() {
            expected.push(frame);
        }
        assert_eq!(expected.len(), 2);

        let mut split = FrameBuffer::default();
        let mut produced = Vec::new();
        for byte in &bytes {
            split.extend(std::slice::from_ref(byte));
            while let Some(frame) = split.next_frame() {
                produced.push(frame);
            }
        }
        assert_eq!(produced, expected);
    }

    #[tokio::test]
    async fn device_found_dispatched_byte_by_byte() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let collected = collecting_scanner(0, &channel);

        let mut ad_data = vec![0x05, 0x09];
        ad_data.extend_from_slice(b"dev1");
        // 0xB8 is -72 when interpreted as signed.
        let params = device_found_params("11:22:33:44:55:66", 0xB8, 0, &ad_data);
        let bytes = frame_bytes(MGMT_EV_DEVICE_FOUND, 0, &params);

        for byte in bytes {
            channel.data_received(&[byte]);
        }

        let infos = collected.lock().unwrap();
        assert_eq!(infos.len(), 1);
        let info = &infos[0];
        assert_eq!(info.address, "11:22:33:44:55:66".parse().unwrap());
        assert_eq!(info.rssi, -72);
        assert_eq!(info.name.as_deref(), Some("dev1"));
        assert_eq!(info.raw.as_deref(), Some(&ad_data[..]));
    }

    #[tokio::test]
    async fn adv_monitor_device_found_skips_monitor_handle() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let collected = collecting_scanner(2, &channel);

        let mut params = vec![0xAB, 0xCD]; // monitor handle
        params.extend(device_found_params("11:22:33:44:55:66", 0xC5, 0, &[]));
        channel.data_received(&frame_bytes(MGMT_EV_ADV_MONITOR_DEVICE_FOUND, 2, &params));

        let infos = collected.lock().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].rssi, -59);
    }

    #[tokio::test]
    async fn unknown_event_and_missing_scanner_dropped() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let collected = collecting_scanner(0, &channel);

        // Unknown event code.
        channel.data_received(&frame_bytes(0x0042, 0, &[1, 2, 3]));
        // Device found for a controller without a scanner.
        let params = device_found_params("11:22:33:44:55:66", 0xB8, 0, &[]);
        channel.data_received(&frame_bytes(MGMT_EV_DEVICE_FOUND, 7, &params));

        assert!(collected.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn command_complete_resolves_pending_response() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let response = channel.setup_command_response(MGMT_OP_LOAD_CONN_PARAM);

        let mut params = MGMT_OP_LOAD_CONN_PARAM.to_le_bytes().to_vec();
        params.push(0x00);
        params.extend_from_slice(&[0xAA, 0xBB]);
        channel.data_received(&frame_bytes(MGMT_EV_CMD_COMPLETE, 0, &params));

        let (status, rest) = response.await.unwrap();
        assert_eq!(status, 0x00);
        assert_eq!(rest, vec![0xAA, 0xBB]);
    }

    #[tokio::test]
    async fn load_conn_params_wire_format() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let io = MockIo::new();
        channel.install_io_for_test(io.clone());

        let address: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(channel.load_conn_params(0, address, AddressType::LePublic, ConnectParams::Fast));

        let sent = io.sent.lock().unwrap();
        let frame = &sent[0];
        assert_eq!(&frame[0..2], &MGMT_OP_LOAD_CONN_PARAM.to_le_bytes());
        assert_eq!(&frame[2..4], &0u16.to_le_bytes());
        assert_eq!(&frame[4..6], &17u16.to_le_bytes());
        assert_eq!(&frame[6..8], &1u16.to_le_bytes());
        // MAC is byte-reversed on the wire.
        assert_eq!(&frame[8..14], &[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(frame[14], 1);
        assert_eq!(&frame[15..17], &FAST_MIN_CONN_INTERVAL.to_le_bytes());
        assert_eq!(&frame[17..19], &FAST_MAX_CONN_INTERVAL.to_le_bytes());
        assert_eq!(&frame[19..21], &FAST_CONN_LATENCY.to_le_bytes());
        assert_eq!(&frame[21..23], &FAST_CONN_TIMEOUT.to_le_bytes());
    }

    #[tokio::test]
    async fn send_returning_zero_is_success() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        channel.install_io_for_test(MockIo::returning_zero());
        let address: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(channel.load_conn_params(0, address, AddressType::LeRandom, ConnectParams::Medium));
    }

    #[tokio::test]
    async fn load_conn_params_without_connection_fails() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let address: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        assert!(!channel.load_conn_params(0, address, AddressType::LePublic, ConnectParams::Fast));
    }

    #[test]
    fn capability_status_policy() {
        assert!(has_capabilities_from_status(0x00));
        assert!(has_capabilities_from_status(0x11));
        assert!(!has_capabilities_from_status(0x14));
        assert!(!has_capabilities_from_status(0x01));
        assert!(!has_capabilities_from_status(0x0D));
    }

    async fn finish_setup_with_probe_status(status: u8) -> (MgmtChannel, Result<()>) {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        channel.install_io_for_test(MockIo::new());

        let probe_channel = channel.clone();
        let setup = tokio::spawn(async move { probe_channel.finish_setup().await });
        tokio::task::yield_now().await;

        let mut params = MGMT_OP_GET_CONNECTIONS.to_le_bytes().to_vec();
        params.push(status);
        channel.data_received(&frame_bytes(MGMT_EV_CMD_COMPLETE, 0, &params));

        let result = setup.await.unwrap();
        (channel, result)
    }

    #[tokio::test(start_paused = true)]
    async fn probe_permission_denied_fails_setup() {
        let (channel, result) = finish_setup_with_probe_status(0x14).await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert!(!channel.is_connected());
        assert_eq!(channel.reconnect_task_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_invalid_index_passes_setup() {
        let (channel, result) = finish_setup_with_probe_status(0x11).await;
        result.unwrap();
        assert!(channel.is_connected());
        assert_eq!(channel.reconnect_task_count(), 1);
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_fails_setup() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        channel.install_io_for_test(MockIo::new());

        let result = channel.finish_setup().await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
        assert_eq!(channel.reconnect_task_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_abandons_pending() {
        let channel = MgmtChannel::new(Duration::from_secs(5));
        let response = channel.setup_command_response(MGMT_OP_GET_CONNECTIONS);
        channel.close();
        channel.close();
        assert!(response.await.is_err());
        assert!(channel.setup().await.is_err());
    }
}
