//! Buttonless DFU trigger and post-reboot rediscovery (spec §4.4).
//!
//! A device running ordinary application firmware that also links the
//! Nordic Buttonless DFU service can be rebooted straight into its
//! bootloader with a single unacknowledged control-point write. The
//! bootloader re-advertises under a related, but not identical, name and
//! sometimes address — rediscovery has to be a little fuzzy about which
//! device reappeared.

use std::time::Duration;

use crate::error::{DfuError, DfuResult};
use crate::transport::{DfuTransport, DfuTransportManager, DiscoveredDevice};

/// The single byte that asks an application-mode target to reboot into
/// its bootloader.
const BUTTONLESS_TRIGGER: u8 = 0x01;

/// Suffix the bootloader appends to the original advertised name.
const BOOTLOADER_NAME_SUFFIXES: [&str; 2] = ["Dfu", "DFU"];

/// Substring any bootloader advertisement is expected to contain,
/// independent of the application's original name.
const BOOTLOADER_NAME_HINT: &str = "DfuTarg";

/// Write the buttonless trigger and disconnect, asking the target to
/// reboot into its bootloader. The caller is responsible for dropping
/// its transport handle afterward; this only performs the write.
pub async fn trigger_bootloader_reboot(transport: &impl DfuTransport) -> DfuResult<()> {
    transport.write_control(&[BUTTONLESS_TRIGGER], false).await?;
    transport.disconnect().await?;
    Ok(())
}

/// Whether `candidate`'s advertised name plausibly belongs to the same
/// device's bootloader mode, given the application-mode name it was
/// originally resolved from.
fn name_matches_bootloader(original_name: &str, candidate: &DiscoveredDevice) -> bool {
    if candidate.name.contains(BOOTLOADER_NAME_HINT) {
        return true;
    }
    BOOTLOADER_NAME_SUFFIXES
        .iter()
        .any(|suffix| candidate.name == format!("{original_name}{suffix}"))
}

/// Whether `candidate`'s address matches `original_address` exactly or
/// differs only in its last octet by one (some Nordic bootloaders
/// increment the static address when entering DFU mode).
fn address_matches_bootloader(original_address: &str, candidate: &DiscoveredDevice) -> bool {
    if candidate.address.eq_ignore_ascii_case(original_address) {
        return true;
    }
    let (Some(original_last), Some(candidate_last)) = (
        last_octet(original_address),
        last_octet(&candidate.address),
    ) else {
        return false;
    };
    original_last.abs_diff(candidate_last) == 1
}

fn last_octet(address: &str) -> Option<u8> {
    let last_group = address.rsplit(':').next()?;
    u8::from_str_radix(last_group, 16).ok()
}

/// Re-scan for a device that was just asked to reboot — either via the
/// buttonless trigger above, or via ACTIVATE_AND_RESET between images in
/// a multi-image bundle (spec §4.6 step 5 uses the same strategy).
/// Matches on name suffix/hint or address (exact or off-by-one).
pub async fn rediscover_target<M: DfuTransportManager>(
    manager: &M,
    original_name: &str,
    original_address: &str,
    timeout: Duration,
) -> DfuResult<M::Transport> {
    let devices = manager.scan(timeout).await?;
    let found = devices.into_iter().find(|candidate| {
        name_matches_bootloader(original_name, candidate)
            || address_matches_bootloader(original_address, candidate)
    });

    let device = found.ok_or(DfuError::DeviceNotFound {
        timeout_secs: timeout.as_secs(),
    })?;

    manager.connect(&device.address, timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, address: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.to_string(),
            address: address.to_string(),
            rssi: None,
        }
    }

    #[test]
    fn matches_name_suffix() {
        let candidate = device("OD216205Dfu", "AA:BB:CC:DD:EE:01");
        assert!(name_matches_bootloader("OD216205", &candidate));
    }

    #[test]
    fn matches_dfu_targ_hint_regardless_of_original_name() {
        let candidate = device("DfuTarg", "AA:BB:CC:DD:EE:01");
        assert!(name_matches_bootloader("OD216205", &candidate));
    }

    #[test]
    fn unrelated_name_does_not_match() {
        let candidate = device("SomeOtherDevice", "AA:BB:CC:DD:EE:01");
        assert!(!name_matches_bootloader("OD216205", &candidate));
    }

    #[test]
    fn matches_address_plus_one() {
        let candidate = device("anything", "AA:BB:CC:DD:EE:02");
        assert!(address_matches_bootloader("AA:BB:CC:DD:EE:01", &candidate));
    }

    #[test]
    fn matches_exact_address() {
        let candidate = device("anything", "AA:BB:CC:DD:EE:01");
        assert!(address_matches_bootloader("AA:BB:CC:DD:EE:01", &candidate));
    }

    #[test]
    fn distant_address_does_not_match() {
        let candidate = device("anything", "AA:BB:CC:DD:EE:9A");
        assert!(!address_matches_bootloader("AA:BB:CC:DD:EE:01", &candidate));
    }
}
