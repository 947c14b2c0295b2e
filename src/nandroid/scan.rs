//! Backup file naming, backup type detection and finding backups on the SD card.

use std::fs;
use std::path::{Path, PathBuf};

use super::{BackupType, PartitionMark, MD5_MANIFEST, NANDROID_DIRS};
use crate::config::RecoveryConfig;
use crate::partition::PartitionTable;
use crate::util::basename;
use crate::volume::{Volume, Volumes};

/// A backup directory and the partitions it can restore
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Bundle {
    pub dir: PathBuf,
    pub partitions: Vec<PartitionMark>,
    /// Whether the directory has a checksum manifest
    pub md5: bool,
}

impl Bundle {
    /// The directory's own name, as shown in menus
    pub fn name(&self) -> String {
        basename(&self.dir.to_string_lossy()).to_string()
    }

    /// Ids of the selected partitions, in scan order
    pub fn selected(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .filter(|m| m.selected)
            .map(|m| m.id)
            .collect()
    }

    /// Flip the selection of partition `id`, if the bundle has it.
    pub fn toggle(&mut self, id: usize) -> bool {
        match self.partitions.iter_mut().find(|m| m.id == id) {
            Some(mark) => {
                mark.toggle();
                true
            }
            None => false,
        }
    }
}

/// `/sd-ext` -> `sd-ext`, `/data/app` -> `data_app`
///
/// Nested paths are flattened into one file name rather than a subdirectory of the backup, so
/// `/data/app` is saved as `data_app.tar`, not `data/app.tar` as older nandroid tools did. The
/// two only differ for nested paths, and none of the built-in partitions are nested.
pub fn file_stem(path: &str) -> String {
    path.trim_start_matches('/').replace('/', "_")
}

/// Where a backup of `path` of the given type lives in `dir`. Raw images are named after the
/// device, everything else after the path.
pub fn backup_file(dir: &Path, path: &str, volume: &Volume, kind: BackupType) -> PathBuf {
    let stem = match kind {
        BackupType::Raw => volume.device_name().to_string(),
        _ => file_stem(path),
    };
    dir.join(format!("{stem}{}", kind.extension()))
}

pub fn type_for_volume(volume: &Volume, config: &RecoveryConfig) -> BackupType {
    if volume.is_raw() {
        BackupType::Raw
    } else {
        BackupType::configured(config)
    }
}

pub fn existing_type_for_volume(volume: &Volume, dir: &Path, path: &str) -> Option<BackupType> {
    if volume.is_raw() {
        return backup_file(dir, path, volume, BackupType::Raw)
            .exists()
            .then_some(BackupType::Raw);
    }

    BackupType::PROBE_ORDER
        .into_iter()
        .find(|&kind| backup_file(dir, path, volume, kind).exists())
}

/// The type a new backup of `path` would use; `None` if the device has no such volume.
pub fn type_for_new(
    volumes: &dyn Volumes,
    config: &RecoveryConfig,
    path: &str,
) -> Option<BackupType> {
    volumes
        .lookup(path)
        .map(|volume| type_for_volume(volume, config))
}

/// The type of the backup of `path` already in `dir`, if there is one.
pub fn type_for_existing(volumes: &dyn Volumes, dir: &Path, path: &str) -> Option<BackupType> {
    volumes
        .lookup(path)
        .and_then(|volume| existing_type_for_volume(volume, dir, path))
}

/// The backup file for `path` in `dir`: the existing one if there is one, else where a new one
/// would go.
pub fn file_path_for(
    volumes: &dyn Volumes,
    config: &RecoveryConfig,
    dir: &Path,
    path: &str,
) -> Option<PathBuf> {
    let volume = volumes.lookup(path)?;
    let kind = existing_type_for_volume(volume, dir, path)
        .unwrap_or_else(|| type_for_volume(volume, config));
    Some(backup_file(dir, path, volume, kind))
}

/// Treat `dir` as a backup if it holds a backup of any restoreable partition.
pub fn scan_dir(volumes: &dyn Volumes, partitions: &PartitionTable, dir: &Path) -> Option<Bundle> {
    let found: Vec<PartitionMark> = partitions
        .iter()
        .filter(|p| p.flags.restoreable)
        .filter(|p| type_for_existing(volumes, dir, &p.path).is_some())
        .map(|p| PartitionMark {
            id: p.id,
            selected: true,
        })
        .collect();

    if found.is_empty() {
        return None;
    }
    Some(Bundle {
        dir: dir.to_path_buf(),
        partitions: found,
        md5: dir.join(MD5_MANIFEST).is_file(),
    })
}

/// Every backup directly under each of `roots`, roots in order, each sorted by name.
pub fn scan_dirs<P: AsRef<Path>>(
    volumes: &dyn Volumes,
    partitions: &PartitionTable,
    roots: &[P],
) -> Vec<Bundle> {
    let mut bundles = Vec::new();
    for root in roots {
        let root = root.as_ref();
        let entries = match fs::read_dir(root) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("not scanning {}: {e}", root.display());
                continue;
            }
        };

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.path())
            .collect();
        dirs.sort();

        bundles.extend(
            dirs.iter()
                .filter_map(|dir| scan_dir(volumes, partitions, dir)),
        );
    }
    bundles
}

/// Mount whichever of `roots` live on a volume, then scan them all.
pub fn scan_roots<P: AsRef<Path>>(
    volumes: &mut dyn Volumes,
    partitions: &PartitionTable,
    roots: &[P],
) -> Vec<Bundle> {
    for root in roots {
        let root = root.as_ref().to_string_lossy();
        if volumes.has_volume(&root) {
            if let Err(e) = volumes.ensure_mounted(&root) {
                log::warn!("cannot mount {root}: {e:#}");
            }
        }
    }
    let bundles = scan_dirs(&*volumes, partitions, roots);
    log::info!("found {} nandroid backups", bundles.len());
    bundles
}

/// Find the backups in the usual places on the SD card.
pub fn scan(volumes: &mut dyn Volumes, partitions: &PartitionTable) -> Vec<Bundle> {
    scan_roots(volumes, partitions, &NANDROID_DIRS)
}

#[cfg(test)]
use crate::testutil::{FakeVolumes, TEST_FSTAB};

#[test]
fn test_backup_file_names() {
    let volumes = FakeVolumes::new(TEST_FSTAB);
    let dir = Path::new("/sdcard/nandroid/x");
    let boot = volumes.lookup("/boot").unwrap();
    let data = volumes.lookup("/data").unwrap();
    let recovery = volumes.lookup("/recovery").unwrap();

    assert_eq!(
        backup_file(dir, "/boot", boot, BackupType::Raw),
        dir.join("boot.img")
    );
    assert_eq!(
        backup_file(dir, "/recovery", recovery, BackupType::Raw),
        dir.join("mmcblk0p4.img")
    );
    assert_eq!(
        backup_file(dir, "/data", data, BackupType::TarLzma),
        dir.join("data.tar.lzma")
    );
    assert_eq!(file_stem("/data/app"), "data_app");
}

#[test]
fn test_type_priority() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let volumes = FakeVolumes::new(TEST_FSTAB);
    let mut config = RecoveryConfig::default();

    assert_eq!(type_for_existing(&volumes, dir.path(), "/cache"), None);
    assert_eq!(type_for_existing(&volumes, dir.path(), "/nowhere"), None);
    assert_eq!(type_for_new(&volumes, &config, "/nowhere"), None);

    fs::write(dir.path().join("cache.tar.gz"), b"")?;
    assert_eq!(
        type_for_existing(&volumes, dir.path(), "/cache"),
        Some(BackupType::TarGz)
    );
    fs::write(dir.path().join("cache.tar"), b"")?;
    assert_eq!(
        type_for_existing(&volumes, dir.path(), "/cache"),
        Some(BackupType::Tar)
    );

    // Raw volumes only ever have raw images
    assert_eq!(type_for_new(&volumes, &config, "/boot"), Some(BackupType::Raw));
    fs::write(dir.path().join("boot.tar"), b"")?;
    assert_eq!(type_for_existing(&volumes, dir.path(), "/boot"), None);

    // An existing backup decides the file name; otherwise the configured type does
    config.nandroid_type = BackupType::TarBz2.index();
    assert_eq!(
        file_path_for(&volumes, &config, dir.path(), "/cache"),
        Some(dir.path().join("cache.tar"))
    );
    assert_eq!(
        file_path_for(&volumes, &config, dir.path(), "/system"),
        Some(dir.path().join("system.tar.bz2"))
    );
    Ok(())
}

#[test]
fn test_scan_dirs() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let nandroid = sdcard.path().join("nandroid");
    let cwm = sdcard.path().join("clockworkmod/backup");
    for dir in ["nandroid/b", "nandroid/a", "nandroid/empty", "nandroid/.hidden"] {
        fs::create_dir_all(sdcard.path().join(dir))?;
    }
    fs::create_dir_all(cwm.join("old"))?;
    fs::write(nandroid.join("a/boot.img"), b"")?;
    fs::write(nandroid.join("a/system.tar"), b"")?;
    fs::write(nandroid.join("a/nandroid.md5"), b"")?;
    fs::write(nandroid.join("b/data.img"), b"")?;
    fs::write(nandroid.join(".hidden/cache.tar"), b"")?;
    fs::write(nandroid.join("empty/notes.txt"), b"")?;
    fs::write(cwm.join("old/cache.tar.bz2"), b"")?;
    // A stray file next to the backups is not a backup
    fs::write(nandroid.join("cache.tar"), b"")?;

    let volumes = FakeVolumes::new(TEST_FSTAB);
    let partitions = PartitionTable::builtin();
    let roots = [&nandroid, &cwm, &sdcard.path().join("missing")];

    let bundles = scan_dirs(&volumes, &partitions, &roots);
    let summary: Vec<(String, Vec<usize>, bool)> = bundles
        .iter()
        .map(|b| (b.name(), b.selected(), b.md5))
        .collect();
    assert_eq!(
        summary,
        [
            ("a".to_string(), vec![0, 1], true),
            ("b".to_string(), vec![2], false),
            ("old".to_string(), vec![4], false),
        ]
    );

    assert_eq!(scan_dirs(&volumes, &partitions, &roots), bundles);
    Ok(())
}

#[test]
fn test_bundle_toggle() {
    let mut bundle = Bundle {
        dir: PathBuf::from("/sdcard/nandroid/mine"),
        partitions: vec![
            PartitionMark {
                id: 1,
                selected: true,
            },
            PartitionMark {
                id: 4,
                selected: true,
            },
        ],
        md5: true,
    };

    assert!(bundle.toggle(4));
    assert_eq!(bundle.selected(), [1]);
    assert!(!bundle.toggle(2));
    assert!(bundle.toggle(4));
    assert_eq!(bundle.selected(), [1, 4]);
    assert_eq!(bundle.name(), "mine");
}

#[test]
fn test_scan_roots_mounts_volumes_only() -> anyhow::Result<()> {
    let host = tempfile::tempdir()?;
    fs::create_dir_all(host.path().join("x"))?;
    fs::write(host.path().join("x/cache.tar"), b"")?;

    let mut volumes = FakeVolumes::new(TEST_FSTAB);
    let partitions = PartitionTable::builtin();
    let roots = [PathBuf::from("/sdcard/nandroid"), host.path().to_path_buf()];

    let bundles = scan_roots(&mut volumes, &partitions, &roots);
    assert_eq!(volumes.events, ["mount /sdcard"]);
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].name(), "x");

    // A root whose volume won't mount is skipped; the others are still scanned
    let mut volumes = FakeVolumes::new(TEST_FSTAB);
    volumes.fail("/sdcard");
    assert_eq!(scan_roots(&mut volumes, &partitions, &roots), bundles);
    assert!(volumes.events.is_empty());
    Ok(())
}
