//! Caller-adjustable knobs for a DFU session.
//!
//! Defaults follow spec §4.5.4 and §5: 10 packets between receipt
//! notifications everywhere except Apple platforms (8, to stay inside
//! CoreBluetooth's conservative write-without-response buffering), and a
//! 30s timeout on every control-point exchange except activation, which
//! gets a 5s disconnect-detection window instead.

use std::time::Duration;

/// Platform-sensitive default packets-per-notification.
///
/// macOS's CoreBluetooth write-without-response queue has been observed
/// to overrun at the cross-platform default of 10; 8 is the empirically
/// safe value there.
pub const DEFAULT_PACKETS_PER_NOTIFICATION_MACOS: u16 = 8;
pub const DEFAULT_PACKETS_PER_NOTIFICATION: u16 = 10;

/// Tunable parameters for a single `perform_dfu` invocation.
#[derive(Debug, Clone)]
pub struct DfuConfig {
    /// Number of 20-byte data packets sent before the host must await a
    /// packet-receipt notification. `None` resolves to the
    /// platform-sensitive default.
    pub packets_per_notification: Option<u16>,
    /// Timeout for a control-point response (every op except ACTIVATE).
    pub response_timeout: Duration,
    /// Timeout for a packet-receipt notification during TRANSFER.
    pub receipt_timeout: Duration,
    /// Timeout for device rediscovery after a buttonless trigger or
    /// between images in a multi-image bundle.
    pub rediscovery_timeout: Duration,
    /// Window after ACTIVATE within which a disconnect is treated as
    /// success.
    pub activation_timeout: Duration,
}

impl DfuConfig {
    /// The packets-per-notification value to actually use, resolving the
    /// platform-sensitive default if the caller didn't override it.
    pub fn resolved_packets_per_notification(&self) -> u16 {
        self.packets_per_notification.unwrap_or_else(|| {
            if cfg!(target_os = "macos") {
                DEFAULT_PACKETS_PER_NOTIFICATION_MACOS
            } else {
                DEFAULT_PACKETS_PER_NOTIFICATION
            }
        })
    }
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            packets_per_notification: None,
            response_timeout: Duration::from_secs(30),
            receipt_timeout: Duration::from_secs(30),
            rediscovery_timeout: Duration::from_secs(30),
            activation_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_timeouts_match_spec() {
        let cfg = DfuConfig::default();
        assert_eq!(cfg.response_timeout, Duration::from_secs(30));
        assert_eq!(cfg.receipt_timeout, Duration::from_secs(30));
        assert_eq!(cfg.rediscovery_timeout, Duration::from_secs(30));
        assert_eq!(cfg.activation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn explicit_override_wins_over_platform_default() {
        let mut cfg = DfuConfig::default();
        cfg.packets_per_notification = Some(4);
        assert_eq!(cfg.resolved_packets_per_notification(), 4);
    }
}
