//! Persistent recovery settings, stored as a small checksummed binary record on `/cache`.

use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use std::fs;

use crate::volume::Volumes;

pub const CONFIG_PATH: &str = "/cache/recovery_config.dat";

const CONFIG_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CONFIG_VERSION: u8 = 1;

/// Index of the tar backup type, the default for new backups
const DEFAULT_NANDROID_TYPE: u8 = 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }
}

const WHITE: Rgba = Rgba::new(255, 255, 255, 255);
const BLUE: Rgba = Rgba::new(54, 74, 255, 255);

/// Colours used to draw the console
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Palette {
    pub normal_text: Rgba,
    pub header_text: Rgba,
    pub menu: Rgba,
    pub menu_text: Rgba,
    pub menu_selected_text: Rgba,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            normal_text: WHITE,
            header_text: WHITE,
            menu: BLUE,
            menu_text: BLUE,
            menu_selected_text: WHITE,
        }
    }
}

/// The settings a session reads and the options menu changes
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecoveryConfig {
    pub palette: Palette,
    pub nandroid_do_md5_verification: bool,
    pub install_do_signature_verification: bool,
    /// Backup type index for new non-raw backups; out-of-range values mean tar
    pub nandroid_type: u8,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            palette: Palette::default(),
            nandroid_do_md5_verification: true,
            install_do_signature_verification: false,
            nandroid_type: DEFAULT_NANDROID_TYPE,
        }
    }
}

/// On-disk layout
#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(magic = b"RZCF")]
struct ConfigRecord {
    version: u8,
    normal_text: Rgba,
    header_text: Rgba,
    menu: Rgba,
    menu_text: Rgba,
    menu_selected_text: Rgba,
    md5_verification: u8,
    signature_verification: u8,
    nandroid_type: u8,
    #[deku(endian = "little")]
    crc: u32,
}

impl ConfigRecord {
    /// CRC over everything but the trailing CRC field itself
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let bytes = self.to_bytes()?;
        let len = bytes.len() - std::mem::size_of::<u32>();
        Ok(CONFIG_CRC.checksum(&bytes[..len]))
    }
}

impl From<&RecoveryConfig> for ConfigRecord {
    fn from(config: &RecoveryConfig) -> Self {
        let palette = &config.palette;
        Self {
            version: CONFIG_VERSION,
            normal_text: palette.normal_text,
            header_text: palette.header_text,
            menu: palette.menu,
            menu_text: palette.menu_text,
            menu_selected_text: palette.menu_selected_text,
            md5_verification: config.nandroid_do_md5_verification.into(),
            signature_verification: config.install_do_signature_verification.into(),
            nandroid_type: config.nandroid_type,
            crc: 0,
        }
    }
}

impl From<ConfigRecord> for RecoveryConfig {
    fn from(record: ConfigRecord) -> Self {
        Self {
            palette: Palette {
                normal_text: record.normal_text,
                header_text: record.header_text,
                menu: record.menu,
                menu_text: record.menu_text,
                menu_selected_text: record.menu_selected_text,
            },
            nandroid_do_md5_verification: record.md5_verification != 0,
            install_do_signature_verification: record.signature_verification != 0,
            nandroid_type: record.nandroid_type,
        }
    }
}

impl RecoveryConfig {
    /// Parse a stored record, rejecting anything truncated, foreign or corrupt
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let (_, record) = ConfigRecord::from_bytes((bytes, 0)).ok()?;
        if record.version != CONFIG_VERSION {
            return None;
        }
        if record.compute_crc().ok()? != record.crc {
            return None;
        }
        Some(record.into())
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut record = ConfigRecord::from(self);
        record.crc = record.compute_crc()?;
        Ok(record.to_bytes()?)
    }

    /// Read the stored settings, or the defaults if there are none usable.
    pub fn load(volumes: &mut dyn Volumes, path: &str) -> Self {
        if let Err(e) = volumes.ensure_mounted(path) {
            log::warn!("cannot mount {path}: {e:#}");
        }

        match fs::read(path) {
            Ok(bytes) => Self::decode(&bytes).unwrap_or_else(|| {
                log::warn!("{path} is not a valid configuration; using defaults");
                Self::default()
            }),
            Err(e) => {
                log::info!("no configuration at {path} ({e}); using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, volumes: &mut dyn Volumes, path: &str) -> anyhow::Result<()> {
        volumes.ensure_mounted(path)?;
        fs::write(path, self.encode()?)?;
        log::debug!("saved configuration to {path}");
        Ok(())
    }
}

#[cfg(test)]
use crate::testutil::FakeVolumes;

#[test]
fn test_encode_decode() -> anyhow::Result<()> {
    let config = RecoveryConfig {
        nandroid_do_md5_verification: false,
        install_do_signature_verification: true,
        nandroid_type: 4,
        ..Default::default()
    };

    let bytes = config.encode()?;
    assert_eq!(&bytes[..4], b"RZCF");
    assert_eq!(bytes.len(), 4 + 1 + 5 * 4 + 3 + 4);
    assert_eq!(RecoveryConfig::decode(&bytes), Some(config));
    Ok(())
}

#[test]
fn test_decode_rejects_bad_records() -> anyhow::Result<()> {
    let bytes = RecoveryConfig::default().encode()?;

    assert_eq!(RecoveryConfig::decode(&bytes[..bytes.len() - 1]), None);

    let mut corrupt = bytes.clone();
    corrupt[10] ^= 0x01;
    assert_eq!(RecoveryConfig::decode(&corrupt), None);

    let mut foreign = bytes.clone();
    foreign[0] = b'X';
    assert_eq!(RecoveryConfig::decode(&foreign), None);
    Ok(())
}

#[test]
fn test_load_and_save() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("recovery_config.dat");
    let path = path.to_str().unwrap();
    let mut volumes = FakeVolumes::default();

    let mut config = RecoveryConfig::load(&mut volumes, path);
    assert_eq!(config, RecoveryConfig::default());

    config.nandroid_type = 2;
    config.save(&mut volumes, path)?;
    assert_eq!(RecoveryConfig::load(&mut volumes, path), config);

    fs::write(path, b"garbage")?;
    assert_eq!(RecoveryConfig::load(&mut volumes, path), RecoveryConfig::default());
    Ok(())
}
