//! Composes the bundle reader, buttonless trigger, and state machine into
//! the top-level `perform_dfu` / `scan_for_devices` library surface
//! (spec §4.6, §6).

use std::path::Path;
use std::time::Duration;

use crate::bundle::{self, Bundle};
use crate::buttonless;
use crate::config::DfuConfig;
use crate::crc::crc16_ccitt_false;
use crate::error::{DfuError, DfuResult};
use crate::protocol;
use crate::transport::{DfuTransport, DfuTransportManager, DiscoveredDevice};

/// Substrings/suffixes that mark a device as already running the Legacy
/// DFU bootloader rather than application firmware (spec §4.4). A name
/// that doesn't match is assumed to need the buttonless trigger first —
/// see DESIGN.md for why this heuristic, rather than a GATT-level probe,
/// resolves the spec's open question on mode detection.
fn looks_like_bootloader_name(name: &str) -> bool {
    name.contains("DfuTarg") || name.ends_with("Dfu") || name.ends_with("DFU")
}

/// Run a full DFU session: open `zip_path`, resolve `device` (a name or
/// address, matching the CLI's `--device` semantics), trigger and
/// rediscover the bootloader if the target is still running application
/// firmware, then transfer every image in the bundle through to
/// activation.
pub async fn perform_dfu<M: DfuTransportManager>(
    manager: &M,
    zip_path: &Path,
    device: &str,
    config: &DfuConfig,
    mut on_progress: impl FnMut(f32),
    mut on_log: impl FnMut(&str),
) -> DfuResult<()> {
    let bundle: Bundle = bundle::read_bundle(zip_path)?;
    on_log(&format!(
        "opened bundle '{}' with {} image(s)",
        bundle.name,
        bundle.images.len()
    ));

    let mut transport = manager.connect(device, config.rediscovery_timeout).await?;

    if !transport.has_control_point().await {
        return Err(DfuError::NoDfuService);
    }

    if !looks_like_bootloader_name(device) {
        on_log("target appears to be running application firmware; sending buttonless trigger");
        buttonless::trigger_bootloader_reboot(&transport).await?;
        transport = buttonless::rediscover_target(manager, device, device, config.rediscovery_timeout).await?;
        on_log("bootloader rediscovered after buttonless reboot");
    }

    let image_count = bundle.images.len();
    for (index, image) in bundle.images.iter().enumerate() {
        let crc = crc16_ccitt_false(&image.firmware);
        on_log(&format!(
            "image {}/{}: {} bytes, crc16/ccitt-false={crc:#06x}",
            index + 1,
            image_count,
            image.firmware.len(),
        ));

        protocol::run_image(&transport, image, config, &mut on_progress, &mut on_log).await?;

        if index + 1 < image_count {
            on_log("rediscovering target after activation for next image");
            transport =
                buttonless::rediscover_target(manager, device, device, config.rediscovery_timeout).await?;
        }
    }

    on_log("DFU complete");
    Ok(())
}

/// Scan for named BLE devices within `timeout` (spec §6).
pub async fn scan_for_devices<M: DfuTransportManager>(
    manager: &M,
    timeout: Duration,
) -> DfuResult<Vec<DiscoveredDevice>> {
    manager.scan(timeout).await
}
