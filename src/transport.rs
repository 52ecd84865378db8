//! GATT session abstraction (spec §4.3).
//!
//! This is the seam between the state machine and the BLE transport.
//! `DfuTransport` is implemented once against `btleplug`
//! (`transport_btleplug.rs`) and, in tests, against an in-memory mock
//! that scripts a bootloader's responses — neither the protocol driver
//! nor the orchestrator need to know which.

use std::time::Duration;

use crate::error::DfuResult;

/// A connected (or connectable) DFU target.
///
/// Notifications are delivered in arrival order via
/// [`DfuTransport::next_notification`], which is backed by a queue fed
/// by a background task — never by a callback invoked directly on the
/// BLE stack's I/O thread — so the state machine only ever observes
/// notifications from its own `.await` points (spec §9).
pub trait DfuTransport {
    /// Whether the connected peripheral exposes the Legacy DFU
    /// control-point characteristic at all. Checked once up front so a
    /// non-DFU target fails fast with `DfuError::NoDfuService` instead of
    /// surfacing a generic transport error deep inside the state machine
    /// (spec §4.6 step 3).
    async fn has_control_point(&self) -> bool;

    /// Write to the DFU control-point characteristic.
    async fn write_control(&self, bytes: &[u8], with_response: bool) -> DfuResult<()>;

    /// Write without response to the DFU packet (data) characteristic.
    async fn write_packet(&self, bytes: &[u8]) -> DfuResult<()>;

    /// Subscribe to control-point notifications. Must be called before
    /// any notification can be observed via `next_notification`.
    async fn subscribe_control(&self) -> DfuResult<()>;

    /// Wait for the next queued control-point notification, or time out.
    ///
    /// Returns `Ok(None)` on timeout so callers can distinguish a timeout
    /// from a transport failure and attach their own phase-specific
    /// `DfuError::Timeout`.
    async fn next_notification(&self, timeout: Duration) -> DfuResult<Option<Vec<u8>>>;

    /// Whether the underlying connection is currently up. Polled by the
    /// orchestrator after ACTIVATE to detect the target's self-reboot.
    async fn is_connected(&self) -> bool;

    /// Close the connection cleanly.
    async fn disconnect(&self) -> DfuResult<()>;
}

/// Resolves a device reference (name, address, or an already-connected
/// handle) into a connected [`DfuTransport`].
pub trait DfuTransportManager {
    type Transport: DfuTransport;

    /// Connect to a target by name or address string, scanning for up to
    /// `timeout` before giving up with `DfuError::DeviceNotFound`.
    async fn connect(&self, target: &str, timeout: Duration) -> DfuResult<Self::Transport>;

    /// Scan for named BLE devices for up to `timeout`.
    async fn scan(&self, timeout: Duration) -> DfuResult<Vec<DiscoveredDevice>>;
}

/// A device observed during a scan, as returned by `scan_for_devices`
/// (spec §6).
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}
