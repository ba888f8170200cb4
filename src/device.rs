//! Device and channel records plus the enumeration reconciliation rule.

use serde::{Deserialize, Serialize};

/// The backend model a stream is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Api {
    /// Singleton low-latency driver protocol. One device owns input and
    /// output; only one stream per process can hold it.
    Driver,
    /// Desktop mixing service. Per-endpoint shared-mode sessions behind a
    /// worker thread.
    Mixer,
}

/// One audio device as seen by [`Stream::devices`](crate::Stream::devices).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Index into the backend's current device list. Not stable across
    /// re-enumeration; match by `name` to track a device over time.
    pub id: usize,
    pub name: String,
    pub input_channels: usize,
    pub output_channels: usize,
    /// Sample rates the device reported support for.
    pub sample_rates: Vec<f64>,
    /// Whether the backend considers this a default device.
    pub default_device: bool,
    pub api: Api,
}

/// Per-channel facts queried through the driver protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub name: String,
    /// Driver-defined channel group.
    pub group: i64,
    /// Whether the channel is currently active in the driver.
    pub active: bool,
    /// Direction: `true` for a capture channel.
    pub input: bool,
}

/// Reconciles a cached device list with a fresh probe.
///
/// Devices are matched by name: matches are updated in place (keeping their
/// list position), cached entries with no match are dropped, and unmatched
/// probed devices are appended.
pub(crate) fn merge_device_list(existing: &mut Vec<DeviceInfo>, probed: Vec<DeviceInfo>) {
    let mut kept = vec![false; existing.len()];
    let mut fresh = Vec::new();
    for device in probed {
        match existing.iter().position(|d| d.name == device.name) {
            Some(i) => {
                existing[i] = device;
                kept[i] = true;
            }
            None => fresh.push(device),
        }
    }
    let mut flags = kept.into_iter();
    existing.retain(|_| flags.next().unwrap_or(false));
    existing.extend(fresh);
}
