//! Error types for the Legacy DFU driver.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type DfuResult<T> = Result<T, DfuError>;

/// Root error type. Every failure mode described by the driver funnels
/// into one of these variants.
#[derive(Debug, Error)]
pub enum DfuError {
    /// Bundle manifest missing, not valid JSON, or references files the
    /// archive doesn't contain.
    #[error("malformed DFU bundle: {reason}")]
    BundleMalformed { reason: String },

    /// Bundle manifest declares an image-type combination this driver
    /// doesn't recognize.
    #[error("unsupported DFU bundle: {reason}")]
    BundleUnsupported { reason: String },

    /// A scan (initial or post-reboot rediscovery) exhausted its timeout
    /// without finding a matching device.
    #[error("device not found after scanning for {timeout_secs}s")]
    DeviceNotFound { timeout_secs: u64 },

    /// Connected successfully, but the target doesn't expose the Legacy
    /// DFU control-point characteristic at all — not a DFU device (or not
    /// one running this protocol), so the orchestrator never attempts the
    /// buttonless trigger or state machine against it.
    #[error("target does not expose the Legacy DFU service")]
    NoDfuService,

    /// The underlying BLE stack reported connection loss, a missing
    /// characteristic, or a write failure.
    #[error("BLE transport error: {0}")]
    GattTransport(String),

    /// The target responded to a control-point op with a non-success
    /// status.
    #[error("DFU target rejected op 0x{opcode:02X} in phase {phase}: status 0x{status:02X} ({status_name})")]
    Protocol {
        phase: &'static str,
        opcode: u8,
        status: u8,
        status_name: &'static str,
    },

    /// The receipt notification's reported byte count didn't match what
    /// the host had sent.
    #[error("byte count mismatch in phase {phase}: target reports {reported}, host sent {sent}")]
    ByteCountMismatch {
        phase: &'static str,
        reported: u32,
        sent: u32,
    },

    /// The host timed out waiting for a control-point response or a
    /// packet-receipt notification.
    #[error("timed out waiting for {what} in phase {phase}")]
    Timeout { phase: &'static str, what: &'static str },

    /// Activation was sent but the target did not disconnect within the
    /// activation window.
    #[error("target did not disconnect after activation within {timeout_secs}s")]
    ActivationTimeout { timeout_secs: u64 },

    /// I/O error reading the bundle from disk.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON parsing error for `manifest.json`.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<btleplug::Error> for DfuError {
    fn from(err: btleplug::Error) -> Self {
        DfuError::GattTransport(err.to_string())
    }
}

impl DfuError {
    /// Short machine-stable kind name, useful for log lines and for
    /// callers that want to branch on failure category without matching
    /// every variant.
    pub fn kind(&self) -> &'static str {
        match self {
            DfuError::BundleMalformed { .. } => "bundle_malformed",
            DfuError::BundleUnsupported { .. } => "bundle_unsupported",
            DfuError::DeviceNotFound { .. } => "device_not_found",
            DfuError::NoDfuService => "no_dfu_service",
            DfuError::GattTransport(_) => "gatt_transport",
            DfuError::Protocol { .. } => "dfu_protocol",
            DfuError::ByteCountMismatch { .. } => "byte_count_mismatch",
            DfuError::Timeout { .. } => "dfu_timeout",
            DfuError::ActivationTimeout { .. } => "activation_timeout",
            DfuError::Io(_) => "io",
            DfuError::Zip(_) => "zip",
            DfuError::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_carries_opcode_and_status() {
        let err = DfuError::Protocol {
            phase: "INIT",
            opcode: 0x02,
            status: 0x05,
            status_name: "CRC_ERROR",
        };
        assert_eq!(err.kind(), "dfu_protocol");
        assert!(err.to_string().contains("0x02"));
        assert!(err.to_string().contains("CRC_ERROR"));
    }

    #[test]
    fn timeout_error_names_phase() {
        let err = DfuError::Timeout {
            phase: "INIT",
            what: "control-point response",
        };
        assert!(err.to_string().contains("INIT"));
    }
}
