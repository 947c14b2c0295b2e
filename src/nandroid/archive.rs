//! The per-type backup and restore primitives.
//!
//! Archives and YAFFS2 images are made by external tools with the volume mounted; raw images are
//! copied with the volume unmounted, MTD partitions through `RawFlash` and block devices with
//! `dd`.

use std::path::Path;

use super::{BackupType, NandroidError};
use crate::exec::CommandRunner;
use crate::session::Session;
use crate::util::shell_quote;
use crate::volume::Volume;

fn quoted(path: &Path) -> String {
    shell_quote(&path.to_string_lossy())
}

/// The command that saves the mounted volume at `source` to `file`; `None` for raw images.
pub fn backup_command(kind: BackupType, source: &str, file: &Path) -> Option<String> {
    let (src, file) = (shell_quote(source), quoted(file));
    let cmd = match kind {
        BackupType::Raw => return None,
        BackupType::Tar => format!("tar -cf {file} -C {src} ."),
        BackupType::TarGz => format!("tar -czf {file} -C {src} ."),
        BackupType::TarBz2 => format!("tar -cjf {file} -C {src} ."),
        BackupType::TarLzma => format!("tar -cf - -C {src} . | lzma -cz > {file}"),
        BackupType::Yaffs => format!("mkyaffs2image {src} {file}"),
    };
    Some(cmd)
}

/// The command that unpacks `file` into the mounted volume at `target`; `None` for raw images.
pub fn restore_command(kind: BackupType, target: &str, file: &Path) -> Option<String> {
    let (dst, file) = (shell_quote(target), quoted(file));
    let cmd = match kind {
        BackupType::Raw => return None,
        BackupType::Tar => format!("tar -xf {file} -C {dst}"),
        BackupType::TarGz => format!("tar -xzf {file} -C {dst}"),
        BackupType::TarBz2 => format!("tar -xjf {file} -C {dst}"),
        BackupType::TarLzma => format!("lzma -cd {file} | tar -xf - -C {dst}"),
        BackupType::Yaffs => format!("cd {dst} && unyaffs {file}"),
    };
    Some(cmd)
}

fn run_checked(runner: &mut dyn CommandRunner, cmdline: &str) -> Result<(), NandroidError> {
    match runner.run(cmdline)? {
        0 => Ok(()),
        status => Err(NandroidError::CommandFailed { status }),
    }
}

/// Run `cmdline` with `path` mounted, then put the mount back the way it was.
fn run_mounted(session: &mut Session, path: &str, cmdline: &str) -> Result<(), NandroidError> {
    let was_mounted = session.volumes.is_mounted(path);
    session.volumes.ensure_mounted(path)?;

    let result = run_checked(session.runner, cmdline);

    if !was_mounted {
        if let Err(e) = session.volumes.ensure_unmounted(path) {
            log::warn!("cannot unmount {path}: {e:#}");
        }
    }
    result
}

/// Save the volume for `path` to `file` as `kind`.
pub fn backup(
    session: &mut Session,
    volume: &Volume,
    path: &str,
    kind: BackupType,
    file: &Path,
) -> Result<(), NandroidError> {
    match backup_command(kind, path, file) {
        Some(cmdline) => run_mounted(session, path, &cmdline),
        None => {
            session.volumes.ensure_unmounted(path)?;
            if volume.fs_type == "mtd" {
                session.flash.backup(&volume.device, file)?;
                Ok(())
            } else {
                let cmdline = format!("dd if={} of={}", shell_quote(&volume.device), quoted(file));
                run_checked(session.runner, &cmdline)
            }
        }
    }
}

/// Write `file`, a backup of type `kind`, back to the volume for `path`. The volume has already
/// been erased.
pub fn restore(
    session: &mut Session,
    volume: &Volume,
    path: &str,
    kind: BackupType,
    file: &Path,
) -> Result<(), NandroidError> {
    match restore_command(kind, path, file) {
        Some(cmdline) => run_mounted(session, path, &cmdline),
        None => {
            session.volumes.ensure_unmounted(path)?;
            if volume.fs_type == "mtd" {
                session.flash.restore(&volume.device, file)?;
                Ok(())
            } else {
                let cmdline = format!("dd if={} of={}", quoted(file), shell_quote(&volume.device));
                run_checked(session.runner, &cmdline)
            }
        }
    }
}

#[test]
fn test_commands() {
    let file = Path::new("/sdcard/nandroid/x/data.tar.lzma");
    assert_eq!(
        backup_command(BackupType::TarLzma, "/data", file).unwrap(),
        "tar -cf - -C '/data' . | lzma -cz > '/sdcard/nandroid/x/data.tar.lzma'"
    );
    assert_eq!(
        restore_command(BackupType::TarLzma, "/data", file).unwrap(),
        "lzma -cd '/sdcard/nandroid/x/data.tar.lzma' | tar -xf - -C '/data'"
    );

    let file = Path::new("/sdcard/nandroid/x/system.img");
    assert_eq!(
        backup_command(BackupType::Yaffs, "/system", file).unwrap(),
        "mkyaffs2image '/system' '/sdcard/nandroid/x/system.img'"
    );
    assert_eq!(
        restore_command(BackupType::Yaffs, "/system", file).unwrap(),
        "cd '/system' && unyaffs '/sdcard/nandroid/x/system.img'"
    );
    assert_eq!(
        restore_command(BackupType::TarBz2, "/system", file).unwrap(),
        "tar -xjf '/sdcard/nandroid/x/system.img' -C '/system'"
    );
    assert!(backup_command(BackupType::Raw, "/boot", file).is_none());
}

#[cfg(test)]
use crate::testutil::TestRig;

#[test]
fn test_raw_restore_unmounts() -> anyhow::Result<()> {
    let mut rig = TestRig::new([]);
    let file = Path::new("/sdcard/nandroid/x/mmcblk0p4.img");
    let volume = rig.volumes_lookup("/recovery");

    restore(&mut rig.session(), &volume, "/recovery", BackupType::Raw, file)?;
    assert_eq!(
        rig.runner.commands,
        ["dd if='/sdcard/nandroid/x/mmcblk0p4.img' of='/dev/block/mmcblk0p4'"]
    );

    rig.flash.fail = true;
    let boot = rig.volumes_lookup("/boot");
    let result = backup(&mut rig.session(), &boot, "/boot", BackupType::Raw, file);
    assert!(matches!(result, Err(NandroidError::Other(_))));
    Ok(())
}
