//! Nandroid backups: per-partition archives and images in one directory, plus an MD5 manifest.
//!
//! Each partition is saved in the form that suits its volume: raw partitions as images, mounted
//! filesystems as tar archives (optionally compressed) or YAFFS2 images, per the configured
//! default. Restores look at what is actually in the directory rather than at the configuration,
//! so a backup made with one setting restores under any other.

pub mod archive;
pub mod scan;

pub use scan::{scan, scan_dirs, scan_roots, Bundle};

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::config::RecoveryConfig;
use crate::exec::CommandRunner;
use crate::partition::{PartitionDescriptor, PartitionFlags, PartitionTable};
use crate::session::Session;
use crate::util::shell_quote;
use crate::volume::Volumes;

/// Checksums of every other file in a backup directory
pub const MD5_MANIFEST: &str = "nandroid.md5";

/// Where backups are looked for
pub const NANDROID_DIRS: [&str; 2] = ["/sdcard/nandroid", "/sdcard/clockworkmod/backup"];

/// How one partition's backup is stored
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BackupType {
    Raw,
    Tar,
    TarGz,
    TarBz2,
    TarLzma,
    Yaffs,
}

impl BackupType {
    pub const ALL: [Self; 6] = [
        Self::Raw,
        Self::Tar,
        Self::TarGz,
        Self::TarBz2,
        Self::TarLzma,
        Self::Yaffs,
    ];

    /// When several backups of a mounted volume coexist, the first of these wins.
    pub const PROBE_ORDER: [Self; 5] = [
        Self::Tar,
        Self::TarGz,
        Self::TarBz2,
        Self::TarLzma,
        Self::Yaffs,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Raw => ".img",
            Self::Tar => ".tar",
            Self::TarGz => ".tar.gz",
            Self::TarBz2 => ".tar.bz2",
            Self::TarLzma => ".tar.lzma",
            Self::Yaffs => ".img",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Raw => "raw image",
            Self::Tar => "tar",
            Self::TarGz => "tar.gz",
            Self::TarBz2 => "tar.bz2",
            Self::TarLzma => "tar.lzma",
            Self::Yaffs => "yaffs2 image",
        }
    }

    /// The index stored in the configuration
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Option<Self> {
        Self::ALL.get(usize::from(index)).copied()
    }

    /// The type new backups of mounted volumes use. Raw or out-of-range settings mean tar.
    pub fn configured(config: &RecoveryConfig) -> Self {
        match Self::from_index(config.nandroid_type) {
            Some(Self::Raw) | None => Self::Tar,
            Some(kind) => kind,
        }
    }

    /// The non-raw type after this one, wrapping around
    pub fn next_non_raw(self) -> Self {
        let at = Self::PROBE_ORDER.iter().position(|&k| k == self);
        match at {
            Some(at) => Self::PROBE_ORDER[(at + 1) % Self::PROBE_ORDER.len()],
            None => Self::PROBE_ORDER[0],
        }
    }
}

/// A partition found in a backup, and whether the operator wants it
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PartitionMark {
    pub id: usize,
    pub selected: bool,
}

impl PartitionMark {
    pub fn toggle(&mut self) {
        self.selected = !self.selected;
    }
}

/// The compact form used by older menus: `p` is unselected, `-(p + 1)` selected.
impl From<i32> for PartitionMark {
    fn from(marker: i32) -> Self {
        if marker < 0 {
            Self {
                id: (-(marker + 1)) as usize,
                selected: true,
            }
        } else {
            Self {
                id: marker as usize,
                selected: false,
            }
        }
    }
}

impl From<PartitionMark> for i32 {
    fn from(mark: PartitionMark) -> Self {
        let id = mark.id as i32;
        if mark.selected {
            -(id + 1)
        } else {
            id
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NandroidError {
    #[error("volume not found")]
    VolumeNotFound,

    #[error("no backup found")]
    NoBackupFound,

    #[error("{} not found", .0.display())]
    BackupFileMissing(PathBuf),

    #[error("{status}")]
    CommandFailed { status: i32 },

    #[error("nandroid.md5 not found")]
    Md5ManifestMissing,

    #[error("checksum mismatch, md5sum exited with {0}")]
    Md5Mismatch(i32),

    #[error("Error creating backup directory ({0})")]
    BackupDir(io::Error),

    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("{0:#}")]
    Other(#[from] anyhow::Error),
}

impl NandroidError {
    /// Skips leave the partition untouched; everything else is a failure.
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::VolumeNotFound | Self::NoBackupFound | Self::BackupFileMissing(_)
        )
    }
}

/// What happened to one partition
#[derive(Debug)]
pub struct PartitionOutcome {
    pub path: String,
    pub result: Result<(), NandroidError>,
}

/// What a backup or restore did
#[derive(Debug, Default)]
pub struct Report {
    pub outcomes: Vec<PartitionOutcome>,
    /// Result of writing the manifest, for backups
    pub manifest: Option<Result<(), NandroidError>>,
}

impl Report {
    /// Did every attempted partition (and the manifest) succeed? Skips don't count as failures.
    pub fn succeeded(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.result.as_ref().map_or_else(NandroidError::is_skip, |_| true))
            && !matches!(self.manifest, Some(Err(_)))
    }

    /// Partitions that failed outright
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(&o.result, Err(e) if !e.is_skip()))
            .count()
    }
}

/// The partitions a bulk operation covers: the listed ids, or every partition, limited to those
/// with `flag` set that the device has a volume for.
fn covered<'p>(
    table: &'p PartitionTable,
    volumes: &dyn Volumes,
    ids: Option<&[usize]>,
    flag: fn(&PartitionFlags) -> bool,
) -> Vec<&'p PartitionDescriptor> {
    let candidates: Vec<&PartitionDescriptor> = match ids {
        Some(ids) => ids.iter().filter_map(|&id| table.get(id)).collect(),
        None => table.iter().collect(),
    };
    candidates
        .into_iter()
        .filter(|p| flag(&p.flags) && volumes.has_volume(&p.path))
        .collect()
}

/// Make `dir` an empty directory to back up into, mounting the volume it lives on.
fn ensure_dir(volumes: &mut dyn Volumes, dir: &Path) -> io::Result<()> {
    let dir_str = dir.to_string_lossy();
    if volumes.has_volume(&dir_str) {
        if let Err(e) = volumes.ensure_mounted(&dir_str) {
            log::warn!("cannot mount {dir_str}: {e:#}");
        }
    }

    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
    }
    fs::create_dir_all(dir)
}

/// Checksum every regular file in `dir` into the manifest. The exit statuses of all the
/// checksum runs are OR'd together.
fn create_manifest(runner: &mut dyn CommandRunner, dir: &Path) -> Result<(), NandroidError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with('.') && name != MD5_MANIFEST && entry.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort();

    let cd = shell_quote(&dir.to_string_lossy());
    let mut status = 0;
    for (i, name) in names.iter().enumerate() {
        let redirect = if i == 0 { ">" } else { ">>" };
        status |= runner.run(&format!(
            "cd {cd} && md5sum {} {redirect} {MD5_MANIFEST}",
            shell_quote(name)
        ))?;
    }

    match status {
        0 => Ok(()),
        status => Err(NandroidError::CommandFailed { status }),
    }
}

/// Check the files in `dir` against its manifest.
fn check_manifest(runner: &mut dyn CommandRunner, dir: &Path) -> Result<(), NandroidError> {
    if !dir.join(MD5_MANIFEST).is_file() {
        return Err(NandroidError::Md5ManifestMissing);
    }

    let cd = shell_quote(&dir.to_string_lossy());
    match runner.run(&format!("cd {cd} && md5sum -c {MD5_MANIFEST}"))? {
        0 => Ok(()),
        status => Err(NandroidError::Md5Mismatch(status)),
    }
}

fn backup_path(session: &mut Session, dir: &Path, path: &str) -> Result<(), NandroidError> {
    let Some(volume) = session.volumes.lookup(path).cloned() else {
        session.say(format!("Skipping backup of {path} ... (volume not found)\n"));
        return Err(NandroidError::VolumeNotFound);
    };

    let kind = scan::type_for_volume(&volume, session.config);
    let file = scan::backup_file(dir, path, &volume, kind);

    session.say(format!("Backing up {path} ... "));
    let result = archive::backup(session, &volume, path, kind, &file);
    match &result {
        Ok(()) => session.say("done\n"),
        Err(e) => session.say(format!("error ({e})\n")),
    }
    result
}

fn skip_restore(session: &Session, path: &str, e: NandroidError) -> Result<(), NandroidError> {
    session.say(format!("Skipping restore of {path} ... ({e})\n"));
    Err(e)
}

fn restore_path(session: &mut Session, dir: &Path, path: &str) -> Result<(), NandroidError> {
    let Some(volume) = session.volumes.lookup(path).cloned() else {
        return skip_restore(session, path, NandroidError::VolumeNotFound);
    };
    let Some(kind) = scan::existing_type_for_volume(&volume, dir, path) else {
        return skip_restore(session, path, NandroidError::NoBackupFound);
    };
    let file = scan::backup_file(dir, path, &volume, kind);
    if !file.exists() {
        return skip_restore(session, path, NandroidError::BackupFileMissing(file));
    }

    session.say(format!("Erasing {path} before restore ... "));
    if let Err(e) = session.volumes.format(&volume.mount_point) {
        let e = NandroidError::from(e);
        session.say(format!("error ({e})\n"));
        return Err(e);
    }
    session.say("done\n");

    session.say(format!("Restoring {path} ... "));
    let result = archive::restore(session, &volume, path, kind, &file);
    match &result {
        Ok(()) => session.say("done\n"),
        Err(e) => session.say(format!("error ({e})\n")),
    }
    result
}

/// Back up the given partitions (or every saveable one) into `dir`, then write its manifest.
///
/// Only a backup directory that can't be prepared fails the whole operation; partition failures
/// are reported and the rest carry on.
pub fn backup(
    session: &mut Session,
    dir: &Path,
    ids: Option<&[usize]>,
) -> Result<Report, NandroidError> {
    if let Err(e) = ensure_dir(session.volumes, dir) {
        let e = NandroidError::BackupDir(e);
        session.say(format!("{e}\n"));
        return Err(e);
    }

    let parts = covered(session.partitions, session.volumes, ids, |f| f.saveable);
    log::info!("backing up {} partitions to {}", parts.len(), dir.display());

    let rpt = howudoin::new()
        .label("Backing up")
        .set_len(u64::try_from(parts.len()).ok());
    session.ui.show_progress(1.0, 0);

    let mut report = Report::default();
    for (done, part) in parts.iter().enumerate() {
        rpt.desc(part.path.as_str());
        let result = backup_path(session, dir, &part.path);
        if let Err(e) = &result {
            rpt.add_err(format!("{}: {e}", part.path));
        }
        report.outcomes.push(PartitionOutcome {
            path: part.path.clone(),
            result,
        });
        rpt.inc();
        session.ui.set_progress((done + 1) as f32 / parts.len() as f32);
    }

    session.say("Creating MD5 sums ... ");
    let manifest = create_manifest(session.runner, dir);
    match &manifest {
        Ok(()) => session.say("done\n"),
        Err(e) => session.say(format!("error ({e})\n")),
    }
    report.manifest = Some(manifest);

    rpt.close();
    session.ui.reset_progress();
    log::info!(
        "backup to {} finished with {} failures",
        dir.display(),
        report.failures()
    );
    Ok(report)
}

/// Restore the given partitions (or every restoreable one) from `dir`.
///
/// With MD5 verification on, a missing manifest or a checksum mismatch fails before any
/// partition is touched. Each partition is erased before its backup is written back.
pub fn restore(
    session: &mut Session,
    dir: &Path,
    ids: Option<&[usize]>,
) -> Result<Report, NandroidError> {
    let dir_str = dir.to_string_lossy();
    if session.volumes.has_volume(&dir_str) {
        session.volumes.ensure_mounted(&dir_str)?;
    }

    if session.config.nandroid_do_md5_verification {
        session.say("Checking MD5 sums ... ");
        if let Err(e) = check_manifest(session.runner, dir) {
            session.say(format!("error ({e})\n"));
            return Err(e);
        }
        session.say("done\n");
    }

    let parts = covered(session.partitions, session.volumes, ids, |f| f.restoreable);
    log::info!("restoring {} partitions from {}", parts.len(), dir.display());

    let rpt = howudoin::new()
        .label("Restoring")
        .set_len(u64::try_from(parts.len()).ok());
    session.ui.show_progress(1.0, 0);

    let mut report = Report::default();
    for (done, part) in parts.iter().enumerate() {
        rpt.desc(part.path.as_str());
        let result = restore_path(session, dir, &part.path);
        if let Err(e) = &result {
            rpt.add_err(format!("{}: {e}", part.path));
        }
        report.outcomes.push(PartitionOutcome {
            path: part.path.clone(),
            result,
        });
        rpt.inc();
        session.ui.set_progress((done + 1) as f32 / parts.len() as f32);
    }

    rpt.close();
    session.ui.reset_progress();
    log::info!(
        "restore from {} finished with {} failures",
        dir.display(),
        report.failures()
    );
    Ok(report)
}

#[cfg(test)]
use crate::testutil::{FakeRunner, TestRig};

#[cfg(test)]
fn cache_id(rig: &TestRig) -> usize {
    rig.partitions.by_name("cache").map(|p| p.id).unwrap()
}

#[test]
fn test_partition_mark() {
    let mut mark = PartitionMark {
        id: 4,
        selected: false,
    };
    let original = mark;
    mark.toggle();
    assert_eq!(i32::from(mark), -5);
    mark.toggle();
    assert_eq!(mark, original);

    for marker in [-8, -1, 0, 3] {
        let decoded = PartitionMark::from(marker);
        assert_eq!(PartitionMark::from(i32::from(decoded)), decoded);
        assert_eq!(i32::from(decoded), marker);
    }
    assert_eq!(
        PartitionMark::from(-1),
        PartitionMark {
            id: 0,
            selected: true
        }
    );
}

#[test]
fn test_backup_type_config() {
    let mut config = RecoveryConfig::default();
    assert_eq!(BackupType::configured(&config), BackupType::Tar);
    config.nandroid_type = BackupType::TarBz2.index();
    assert_eq!(BackupType::configured(&config), BackupType::TarBz2);
    config.nandroid_type = BackupType::Raw.index();
    assert_eq!(BackupType::configured(&config), BackupType::Tar);
    config.nandroid_type = 42;
    assert_eq!(BackupType::configured(&config), BackupType::Tar);

    assert_eq!(BackupType::Tar.next_non_raw(), BackupType::TarGz);
    assert_eq!(BackupType::Yaffs.next_non_raw(), BackupType::Tar);
    assert_eq!(BackupType::Raw.next_non_raw(), BackupType::Tar);
}

#[test]
fn test_cache_tar_gz_round_trip() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("nandroid/mybackup");
    let archive = dir.join("cache.tar.gz");
    let manifest = dir.join(MD5_MANIFEST);

    let mut rig = TestRig::new([]);
    rig.config.nandroid_type = BackupType::TarGz.index();
    rig.runner = FakeRunner::with_status({
        let (archive, manifest) = (archive.clone(), manifest.clone());
        move |cmd| {
            // Stand in for the archiver and md5sum writing their output
            if cmd.starts_with("tar -czf") {
                fs::write(&archive, b"archive").unwrap();
            } else if cmd.contains("md5sum '") {
                fs::write(&manifest, b"sums").unwrap();
            }
            0
        }
    });
    let id = cache_id(&rig);

    let report = backup(&mut rig.session(), &dir, Some(&[id]))?;
    assert!(report.succeeded());
    assert_eq!(report.outcomes.len(), 1);
    assert!(archive.is_file());

    let report = restore(&mut rig.session(), &dir, Some(&[id]))?;
    assert!(report.succeeded());

    let d = shell_quote(&dir.to_string_lossy());
    let a = shell_quote(&archive.to_string_lossy());
    assert_eq!(
        rig.runner.commands,
        [
            format!("tar -czf {a} -C '/cache' ."),
            format!("cd {d} && md5sum 'cache.tar.gz' > nandroid.md5"),
            format!("cd {d} && md5sum -c nandroid.md5"),
            format!("tar -xzf {a} -C '/cache'"),
        ]
    );
    assert_eq!(
        rig.volumes.events,
        [
            "mount /cache",
            "unmount /cache",
            "format /cache",
            "mount /cache",
            "unmount /cache"
        ]
    );
    let output = rig.ui.output();
    assert!(output.contains("Backing up /cache ... done\n"));
    assert!(output.contains("Erasing /cache before restore ... done\n"));
    assert!(output.contains("Restoring /cache ... done\n"));
    Ok(())
}

#[test]
fn test_backup_all_tolerates_failures() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("all");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("stale.tar"), b"old")?;

    let mut rig = TestRig::new([]);
    rig.runner = FakeRunner::with_status(|cmd| if cmd.contains("'/system'") { 2 } else { 0 });
    rig.volumes = std::mem::take(&mut rig.volumes).mounted("/data");

    let report = backup(&mut rig.session(), &dir, None)?;
    let attempted: Vec<_> = report.outcomes.iter().map(|o| o.path.as_str()).collect();
    // No datadata, sd-ext volumes in the fstab; sdcard isn't saveable
    assert_eq!(attempted, ["/boot", "/system", "/data", "/cache", "/recovery"]);
    assert!(!report.succeeded());
    assert!(!dir.join("stale.tar").exists());

    assert_eq!(rig.flash.backups, [("boot".to_string(), dir.join("boot.img"))]);
    assert!(rig
        .runner
        .commands
        .contains(&format!(
            "dd if='/dev/block/mmcblk0p4' of={}",
            shell_quote(&dir.join("mmcblk0p4.img").to_string_lossy())
        )));
    assert!(rig.ui.output().contains("Backing up /system ... error (2)\n"));
    // /data was mounted before, and stays that way
    assert!(!rig.volumes.events.contains(&"unmount /data".to_string()));
    Ok(())
}

#[test]
fn test_restore_md5_fails_fast() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("broken");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("cache.tar"), b"")?;

    // No manifest: nothing runs at all
    let mut rig = TestRig::new([]);
    let result = restore(&mut rig.session(), &dir, None);
    assert!(matches!(result, Err(NandroidError::Md5ManifestMissing)));
    assert!(rig.runner.commands.is_empty());
    assert!(rig.volumes.events.is_empty());

    // Mismatch: only the check runs
    fs::write(dir.join(MD5_MANIFEST), b"")?;
    rig.runner = FakeRunner::with_status(|_| 1);
    let result = restore(&mut rig.session(), &dir, None);
    assert!(matches!(result, Err(NandroidError::Md5Mismatch(1))));
    assert_eq!(rig.runner.commands.len(), 1);
    assert!(rig.volumes.events.is_empty());
    assert!(rig.flash.restores.is_empty());
    Ok(())
}

#[test]
fn test_restore_skips_missing() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("partial");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("data.tar.bz2"), b"")?;
    fs::write(dir.join("boot.img"), b"")?;

    let mut rig = TestRig::new([]);
    rig.config.nandroid_do_md5_verification = false;
    rig.volumes.fail("/data");

    let report = restore(&mut rig.session(), &dir, None)?;
    let output = rig.ui.output();
    assert!(output.contains("Skipping restore of /system ... (no backup found)\n"));
    assert!(output.contains("Erasing /data before restore ... error (format failed)\n"));
    assert!(output.contains("Restoring /boot ... done\n"));
    assert_eq!(rig.flash.restores, [("boot".to_string(), dir.join("boot.img"))]);
    assert!(!report.succeeded());
    Ok(())
}

#[test]
fn test_backup_dir_not_creatable() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    fs::write(sdcard.path().join("file"), b"")?;

    let mut rig = TestRig::new([]);
    let result = backup(&mut rig.session(), &sdcard.path().join("file/sub"), None);
    assert!(matches!(result, Err(NandroidError::BackupDir(_))));
    assert!(rig.runner.commands.is_empty());
    assert!(rig.volumes.events.is_empty());
    assert!(rig.flash.backups.is_empty());
    assert!(rig.ui.output().contains("Error creating backup directory"));
    Ok(())
}

#[test]
fn test_restore_continues_after_failure() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("partial");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("data.tar"), b"")?;
    fs::write(dir.join("cache.tar"), b"")?;

    let mut rig = TestRig::new([]);
    rig.config.nandroid_do_md5_verification = false;
    rig.volumes.fail("/data");

    let report = restore(&mut rig.session(), &dir, None)?;
    let results: Vec<_> = report
        .outcomes
        .iter()
        .map(|o| (o.path.as_str(), o.result.is_ok()))
        .collect();
    assert!(results.contains(&("/data", false)));
    assert!(results.contains(&("/cache", true)));
    assert_eq!(report.failures(), 1);

    let output = rig.ui.output();
    let data_failed = output
        .find("Erasing /data before restore ... error (format failed)\n")
        .unwrap();
    let cache_done = output.find("Restoring /cache ... done\n").unwrap();
    assert!(data_failed < cache_done);
    assert!(rig.volumes.events.contains(&"format /cache".to_string()));
    Ok(())
}
