#![cfg_attr(docsrs, feature(doc_cfg))]

//! # BlueMux — BLE advertisement aggregation and connection routing
//!
//! This library merges Bluetooth Low Energy advertisements from many
//! heterogeneous scanner sources — local radios reached through the kernel
//! management (MGMT) socket and remote proxies delivering pre-parsed
//! advertisements — into a single coherent view of nearby devices, and routes
//! outbound GATT connections over the best available scanner path.
//!
//! This library depends on the [tokio] asynchronous runtime.
//!
//! The following functionality is provided.
//!
//! * [Central manager](Manager)
//!     * [scanner registry](Manager::register_scanner) with connection-slot accounting
//!     * per-address dedup, merge and best-source selection across scanners
//!     * staleness and unavailability tracking
//!     * advertisement callback fan-out with UUID filtering
//! * [Remote scanners](RemoteScanner)
//!     * progressive per-address merge of incrementally arriving fields
//!     * expiration of stale devices and a scanner watchdog
//! * [Local scanners](LocalScanner)
//!     * raw advertisement ingestion from the MGMT channel
//!     * scanning-mode tracking with active to passive fallback
//! * [MGMT channel](MgmtChannel)
//!     * framed little-endian binary protocol over the kernel control socket
//!     * command and response correlation, capability probing, auto-reconnect
//!     * [connection parameter loading](MgmtChannel::load_conn_params)
//! * [Connection routing](BleClient)
//!     * scanner path scoring by RSSI, slot pressure and recent failures
//!     * slot acquisition and release on every failure path
//! * [Advertisement interval tracking](AdvertisementTracker)
//!     * learned per-device advertising cadence driving availability decisions

#![warn(missing_docs)]

#[cfg(not(target_os = "linux"))]
compile_error!("BlueMux only supports the Linux operating system.");

use macaddr::MacAddr6;
use num_derive::FromPrimitive;
use std::{
    convert::TryInto,
    fmt::{self, Debug, Display, Formatter},
    ops::{Deref, DerefMut},
    str::FromStr,
};
use strum::{Display, EnumString};
use tokio::task::JoinError;

pub mod adapters;
pub mod central;
pub mod client;
pub mod device;
pub mod manager;
pub mod mgmt;
pub mod scanner;
pub mod slots;
mod sys;
pub mod tracker;

pub use crate::{
    central::{get_manager, set_manager},
    client::BleClient,
    device::{AdvertisementData, BleDevice, Connector, ScannerDevice, ServiceInfo, NO_RSSI_VALUE},
    manager::Manager,
    mgmt::{ConnectParams, MgmtChannel},
    scanner::{local::LocalScanner, remote::RemoteScanner, Scanner, ScanningMode},
    slots::SlotManager,
    tracker::AdvertisementTracker,
};

#[doc(no_inline)]
pub use uuid::Uuid;

/// Bluetooth fabric error.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Detailed error message.
    pub message: String,
}

/// Bluetooth fabric error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq, EnumString)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum ErrorKind {
    /// Bluetooth management transport setup failed
    TransportSetupFailed,
    /// Bluetooth management permissions are missing
    PermissionDenied,
    /// Bluetooth connection attempt failed
    ConnectionAttemptFailed,
    /// no connectable Bluetooth adapters are available
    NoConnectableAdapters,
    /// no scanner with a free connection slot can reach the device
    NoConnectionSlot,
    /// Bluetooth adapter is not ready
    NotReady,
    /// the target object was either not present or removed
    NotFound,
    /// Bluetooth operation failed
    Failed,
    /// operation was attempted after shutdown
    Shutdown,
    /// operation was aborted
    Aborted,
    /// invalid Bluetooth address: {0}
    #[strum(disabled)]
    InvalidAddress(String),
    /// internal error: {0}
    #[strum(disabled)]
    Internal(InternalErrorKind),
}

/// Internal Bluetooth fabric error kind.
#[derive(Clone, Debug, displaydoc::Display, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum InternalErrorKind {
    /// invalid value
    InvalidValue,
    /// join error
    JoinError,
    /// IO error {0:?}
    // The error kind is not preserved during serialization.
    #[cfg_attr(feature = "serde", serde(with = "io_errorkind_serde"))]
    Io(std::io::ErrorKind),
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self { kind, message: String::new() }
    }

    pub(crate) fn with_message(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", &self.kind)
        } else {
            write!(f, "{}: {}", &self.kind, &self.message)
        }
    }
}

impl std::error::Error for Error {}

impl From<JoinError> for Error {
    fn from(err: JoinError) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::JoinError), message: err.to_string() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self { kind: ErrorKind::Internal(InternalErrorKind::Io(err.kind())), message: err.to_string() }
    }
}

impl From<InvalidAddress> for Error {
    fn from(err: InvalidAddress) -> Self {
        Self::new(ErrorKind::InvalidAddress(err.0))
    }
}

#[cfg(feature = "serde")]
mod io_errorkind_serde {
    pub fn serialize<S>(_kind: &std::io::ErrorKind, ser: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::Serialize;
        ().serialize(ser)
    }

    pub fn deserialize<'de, D>(deser: D) -> Result<std::io::ErrorKind, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::Deserialize;
        <()>::deserialize(deser)?;
        Ok(std::io::ErrorKind::Other)
    }
}

/// Bluetooth fabric result.
pub type Result<T> = std::result::Result<T, Error>;

/// Bluetooth address.
///
/// The serialized representation is a string in colon-hexadecimal notation.
#[derive(Clone, Copy, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    /// Creates a new Bluetooth address with the specified value.
    pub const fn new(addr: [u8; 6]) -> Self {
        Self(addr)
    }

    /// Any Bluetooth address.
    ///
    /// Corresponds to `00:00:00:00:00:00`.
    pub const fn any() -> Self {
        Self([0; 6])
    }
}

impl Deref for Address {
    type Target = [u8; 6];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Address {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl From<sys::bdaddr_t> for Address {
    fn from(mut addr: sys::bdaddr_t) -> Self {
        addr.b.reverse();
        Self(addr.b)
    }
}

impl From<Address> for sys::bdaddr_t {
    fn from(mut addr: Address) -> Self {
        addr.0.reverse();
        sys::bdaddr_t { b: addr.0 }
    }
}

impl From<MacAddr6> for Address {
    fn from(addr: MacAddr6) -> Self {
        Self(addr.into_array())
    }
}

impl From<Address> for MacAddr6 {
    fn from(addr: Address) -> Self {
        addr.0.into()
    }
}

/// Invalid Bluetooth address error.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct InvalidAddress(pub String);

impl fmt::Display for InvalidAddress {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "invalid Bluetooth address: {}", &self.0)
    }
}

impl std::error::Error for InvalidAddress {}

impl FromStr for Address {
    type Err = InvalidAddress;
    fn from_str(s: &str) -> std::result::Result<Self, InvalidAddress> {
        let fields = s
            .split(':')
            .map(|s| u8::from_str_radix(s, 16).map_err(|_| InvalidAddress(s.to_string())))
            .collect::<std::result::Result<Vec<_>, InvalidAddress>>()?;
        Ok(Self(fields.try_into().map_err(|_| InvalidAddress(s.to_string()))?))
    }
}

impl From<[u8; 6]> for Address {
    fn from(addr: [u8; 6]) -> Self {
        Self(addr)
    }
}

impl From<Address> for [u8; 6] {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_string().serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Bluetooth device address type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Display, EnumString, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum AddressType {
    /// Bluetooth Low Energy (LE) public address.
    #[strum(serialize = "public")]
    LePublic = sys::BDADDR_LE_PUBLIC,
    /// Bluetooth Low Energy (LE) random address.
    #[strum(serialize = "random")]
    LeRandom = sys::BDADDR_LE_RANDOM,
}

impl Default for AddressType {
    fn default() -> Self {
        Self::LePublic
    }
}

/// Handle for a registered callback.
///
/// Dropping the handle removes exactly the registration it was returned for.
#[must_use = "dropping the handle unregisters the callback"]
pub struct CallbackHandle(Option<Box<dyn FnOnce() + Send>>);

impl CallbackHandle {
    pub(crate) fn new(unregister: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(unregister)))
    }
}

impl Debug for CallbackHandle {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("CallbackHandle").finish()
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(unregister) = self.0.take() {
            unregister();
        }
    }
}

lazy_static::lazy_static! {
    static ref MONOTONIC_EPOCH: std::time::Instant = std::time::Instant::now();
}

/// Monotonic time in seconds.
///
/// All advertisement timestamps and staleness decisions are expressed on this
/// clock. It follows the tokio clock, so paused-clock tests drive it.
pub fn monotonic_time() -> f64 {
    tokio::time::Instant::now().into_std().saturating_duration_since(*MONOTONIC_EPOCH).as_secs_f64()
}
