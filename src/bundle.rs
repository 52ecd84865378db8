//! Nordic DFU bundle reader (spec §4.1).
//!
//! A bundle is a ZIP archive (as produced by `nrfutil pkg generate`)
//! containing a `manifest.json` plus one `.bin`/`.dat` pair per declared
//! image group. This module is a pure function of the archive bytes: it
//! performs no BLE activity and does not validate firmware content (the
//! target is responsible for its own CRC checks during VALIDATE).

use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::error::{DfuError, DfuResult};

/// Image-type bitmask sent to the target in the START op (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageType(u16);

impl ImageType {
    pub const SOFTDEVICE: ImageType = ImageType(0x01);
    pub const BOOTLOADER: ImageType = ImageType(0x02);
    pub const APPLICATION: ImageType = ImageType(0x04);

    /// Raw bitmask value as sent on the wire.
    pub fn bits(self) -> u16 {
        self.0
    }

    /// Whether this image type includes the softdevice.
    pub fn has_softdevice(self) -> bool {
        self.0 & Self::SOFTDEVICE.0 != 0
    }

    /// Whether this image type includes the bootloader.
    pub fn has_bootloader(self) -> bool {
        self.0 & Self::BOOTLOADER.0 != 0
    }

    /// Whether this image type includes the application.
    pub fn has_application(self) -> bool {
        self.0 & Self::APPLICATION.0 != 0
    }
}

/// One image group extracted from a bundle: the image-type bitmask, the
/// init packet bytes (`.dat`), and the firmware bytes (`.bin`).
#[derive(Debug, Clone)]
pub struct BundleImage {
    pub image_type: ImageType,
    pub init_packet: Vec<u8>,
    pub firmware: Vec<u8>,
}

/// A parsed bundle: its images (in manifest order) and a human-readable
/// name derived from the archive's file stem, for logging only.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub name: String,
    pub images: Vec<BundleImage>,
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    manifest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ImageGroup {
    bin_file: String,
    dat_file: String,
}

/// Recognized manifest group names and the image-type bitmask each one
/// carries (spec §3, SPEC_FULL.md §5).
fn image_type_for_group(name: &str) -> Option<ImageType> {
    match name {
        "softdevice" => Some(ImageType::SOFTDEVICE),
        "bootloader" => Some(ImageType::BOOTLOADER),
        "application" => Some(ImageType::APPLICATION),
        "softdevice_bootloader" => Some(ImageType(ImageType::SOFTDEVICE.0 | ImageType::BOOTLOADER.0)),
        _ => None,
    }
}

/// Open and parse a DFU bundle from disk.
pub fn read_bundle<P: AsRef<Path>>(path: P) -> DfuResult<Bundle> {
    let path = path.as_ref();
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".to_string());

    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    let manifest_raw = {
        let mut entry = archive
            .by_name("manifest.json")
            .map_err(|_| DfuError::BundleMalformed {
                reason: "missing manifest.json".to_string(),
            })?;
        let mut contents = String::new();
        entry.read_to_string(&mut contents)?;
        contents
    };

    let manifest: RawManifest = serde_json::from_str(&manifest_raw).map_err(|e| {
        DfuError::BundleMalformed {
            reason: format!("manifest.json is not valid JSON: {e}"),
        }
    })?;

    if manifest.manifest.is_empty() {
        return Err(DfuError::BundleMalformed {
            reason: "manifest declares no image groups".to_string(),
        });
    }

    let mut images = Vec::new();
    for (group_name, group_value) in manifest.manifest.iter() {
        let image_type = match image_type_for_group(group_name) {
            Some(t) => t,
            None => continue,
        };

        let group: ImageGroup = serde_json::from_value(group_value.clone()).map_err(|e| {
            DfuError::BundleMalformed {
                reason: format!("manifest group `{group_name}` is malformed: {e}"),
            }
        })?;

        let firmware = read_entry(&mut archive, &group.bin_file)?;
        let init_packet = read_entry(&mut archive, &group.dat_file)?;

        images.push(BundleImage {
            image_type,
            init_packet,
            firmware,
        });
    }

    if images.is_empty() {
        return Err(DfuError::BundleUnsupported {
            reason: format!(
                "manifest contains no recognized image-group keys (saw: {:?})",
                manifest.manifest.keys().collect::<Vec<_>>()
            ),
        });
    }

    Ok(Bundle { name, images })
}

fn read_entry(archive: &mut zip::ZipArchive<std::fs::File>, entry_name: &str) -> DfuResult<Vec<u8>> {
    let mut entry = archive.by_name(entry_name).map_err(|_| DfuError::BundleMalformed {
        reason: format!("manifest references `{entry_name}` which is not in the archive"),
    })?;
    let mut data = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut zip = ZipWriter::new(cursor);
            let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
            for (name, data) in entries {
                zip.start_file(*name, options).unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    fn write_temp_zip(bytes: &[u8]) -> tempfile::TempPath {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.into_temp_path()
    }

    const APP_MANIFEST: &str = r#"{
        "manifest": {
            "application": {
                "bin_file": "app.bin",
                "dat_file": "app.dat"
            }
        }
    }"#;

    #[test]
    fn reads_single_application_image() {
        let zip = build_zip(&[
            ("manifest.json", APP_MANIFEST.as_bytes()),
            ("app.bin", &[0xAA; 4096]),
            ("app.dat", &[0xBB; 32]),
        ]);
        let path = write_temp_zip(&zip);

        let bundle = read_bundle(&path).unwrap();
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].image_type, ImageType::APPLICATION);
        assert_eq!(bundle.images[0].firmware.len(), 4096);
        assert_eq!(bundle.images[0].init_packet.len(), 32);
    }

    #[test]
    fn reads_combined_softdevice_bootloader_image() {
        const MANIFEST: &str = r#"{
            "manifest": {
                "softdevice_bootloader": {
                    "bin_file": "sd_bl.bin",
                    "dat_file": "sd_bl.dat"
                }
            }
        }"#;
        let zip = build_zip(&[
            ("manifest.json", MANIFEST.as_bytes()),
            ("sd_bl.bin", &[0x01; 128]),
            ("sd_bl.dat", &[0x02; 16]),
        ]);
        let path = write_temp_zip(&zip);

        let bundle = read_bundle(&path).unwrap();
        assert_eq!(bundle.images.len(), 1);
        let image_type = bundle.images[0].image_type;
        assert!(image_type.has_softdevice());
        assert!(image_type.has_bootloader());
        assert!(!image_type.has_application());
    }

    #[test]
    fn missing_manifest_is_malformed() {
        let zip = build_zip(&[("app.bin", &[0u8; 4])]);
        let path = write_temp_zip(&zip);

        let err = read_bundle(&path).unwrap_err();
        assert!(matches!(err, DfuError::BundleMalformed { .. }));
    }

    #[test]
    fn manifest_referencing_missing_file_is_malformed() {
        let zip = build_zip(&[("manifest.json", APP_MANIFEST.as_bytes())]);
        let path = write_temp_zip(&zip);

        let err = read_bundle(&path).unwrap_err();
        assert!(matches!(err, DfuError::BundleMalformed { .. }));
    }

    #[test]
    fn invalid_json_manifest_is_malformed() {
        let zip = build_zip(&[("manifest.json", b"{ not json")]);
        let path = write_temp_zip(&zip);

        let err = read_bundle(&path).unwrap_err();
        assert!(matches!(err, DfuError::BundleMalformed { .. }));
    }

    #[test]
    fn unrecognized_group_is_unsupported() {
        const MANIFEST: &str = r#"{
            "manifest": {
                "firmware_of_the_future": {
                    "bin_file": "x.bin",
                    "dat_file": "x.dat"
                }
            }
        }"#;
        let zip = build_zip(&[
            ("manifest.json", MANIFEST.as_bytes()),
            ("x.bin", &[0u8; 4]),
            ("x.dat", &[0u8; 4]),
        ]);
        let path = write_temp_zip(&zip);

        let err = read_bundle(&path).unwrap_err();
        assert!(matches!(err, DfuError::BundleUnsupported { .. }));
    }
}
