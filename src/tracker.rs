//! Advertisement interval tracker.

use std::collections::HashMap;

use crate::{device::ServiceInfo, Address};

/// Number of observed advertisements needed before an interval is learned.
pub const ADVERTISING_TIMES_NEEDED: usize = 16;

/// Leeway added to learned intervals before a device is considered stale.
///
/// Scanners may buffer incoming packets, so a sighting can arrive a little
/// after the true advertising interval has elapsed.
pub const TRACKER_BUFFERING_WOBBLE_SECONDS: f64 = 5.0;

/// Learns the advertising cadence of each device from observed timestamps.
///
/// Once enough sightings have been collected, the maximum gap between
/// consecutive timestamps becomes the learned interval for the address and
/// the timing window is dropped.
#[derive(Debug, Default)]
pub struct AdvertisementTracker {
    /// Learned advertising interval per address in seconds.
    pub intervals: HashMap<Address, f64>,
    /// Caller-injected fallback interval per address in seconds.
    pub fallback_intervals: HashMap<Address, f64>,
    /// Source currently feeding the timing window per address.
    pub sources: HashMap<Address, String>,
    timings: HashMap<Address, Vec<f64>>,
}

impl AdvertisementTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect a sighting.
    ///
    /// The caller must have established that no interval is known yet and
    /// that the source is stable for this address.
    pub fn collect(&mut self, service_info: &ServiceInfo) {
        self.sources.insert(service_info.address, service_info.source.clone());
        let timings = self.timings.entry(service_info.address).or_default();
        timings.push(service_info.time);
        if timings.len() != ADVERTISING_TIMES_NEEDED {
            return;
        }

        let max_time_between_advertisements = timings
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .fold(f64::MIN, f64::max);

        self.intervals.insert(service_info.address, max_time_between_advertisements);
        self.timings.remove(&service_info.address);
    }

    /// Remove all state for an address.
    pub fn remove_address(&mut self, address: &Address) {
        self.intervals.remove(address);
        self.sources.remove(address);
        self.timings.remove(address);
    }

    /// Remove a fallback interval.
    pub fn remove_fallback_interval(&mut self, address: &Address) {
        self.fallback_intervals.remove(address);
    }

    /// Remove all addresses tracked from the given source.
    pub fn remove_source(&mut self, source: &str) {
        let addresses: Vec<Address> = self
            .sources
            .iter()
            .filter(|(_, tracked_source)| tracked_source.as_str() == source)
            .map(|(address, _)| *address)
            .collect();
        for address in addresses {
            self.remove_address(&address);
        }
    }

    /// Clear timing collection data when a scanner pauses.
    ///
    /// When a scanner pauses to establish a connection, it stops listening
    /// for advertisements. Without clearing the timing window, the next
    /// sighting after the connection attempt would record an incorrectly
    /// large gap that does not represent the device's advertising interval.
    pub fn scanner_paused(&mut self, source: &str) {
        // Only iterate through timing data (typically much smaller than sources).
        let addresses: Vec<Address> = self
            .timings
            .keys()
            .copied()
            .filter(|address| self.sources.get(address).map(String::as_str) == Some(source))
            .collect();
        for address in addresses {
            self.timings.remove(&address);
        }
    }

    /// Diagnostic snapshot.
    pub fn diagnostics(&self) -> TrackerDiagnostics {
        TrackerDiagnostics {
            intervals: self.intervals.clone(),
            fallback_intervals: self.fallback_intervals.clone(),
            sources: self.sources.clone(),
            timings: self.timings.clone(),
        }
    }

    #[cfg(test)]
    pub(crate) fn timing_count(&self, address: &Address) -> Option<usize> {
        self.timings.get(address).map(Vec::len)
    }
}

/// Snapshot of the tracker state.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackerDiagnostics {
    /// Learned intervals.
    pub intervals: HashMap<Address, f64>,
    /// Fallback intervals.
    pub fallback_intervals: HashMap<Address, f64>,
    /// Tracked sources.
    pub sources: HashMap<Address, String>,
    /// Open timing windows.
    pub timings: HashMap<Address, Vec<f64>>,
}
