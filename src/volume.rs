//! The volume table: which device backs each root path, how to mount it and how to format it.

use anyhow::{anyhow, bail, Context};
use nix::errno::Errno;
use nix::mount::{mount, umount, MsFlags};
use retry::{delay::Fixed, retry};

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::exec::{CommandRunner, ShellRunner};
use crate::util::{basename, shell_quote};

/// Where the recovery image keeps its volume table
pub const FSTAB_PATH: &str = "/etc/recovery.fstab";

/// One line of the volume table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub mount_point: String,
    pub fs_type: String,
    pub device: String,
    pub device2: Option<String>,
}

impl Volume {
    /// Raw partitions are imaged, never mounted
    pub fn is_raw(&self) -> bool {
        matches!(self.fs_type.as_str(), "mtd" | "emmc")
    }

    /// The device's node name (`boot` for an MTD partition, `mmcblk0p2` for a block device)
    pub fn device_name(&self) -> &str {
        basename(&self.device)
    }
}

/// Parse `mount_point fs_type device [device2]` lines; `#` starts a comment.
pub fn parse_fstab(text: &str) -> anyhow::Result<Vec<Volume>> {
    let mut volumes = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        let [mount_point, fs_type, device, rest @ ..] = fields.as_slice() else {
            bail!("fstab line {}: expected at least 3 fields", lineno + 1);
        };
        if !mount_point.starts_with('/') {
            bail!("fstab line {}: mount point {mount_point:?} is not absolute", lineno + 1);
        }

        volumes.push(Volume {
            mount_point: mount_point.trim_end_matches('/').to_string(),
            fs_type: fs_type.to_string(),
            device: device.to_string(),
            device2: rest.first().map(|d| d.to_string()),
        });
    }
    Ok(volumes)
}

/// Find the volume whose mount point contains `path`, preferring the longest match.
pub fn volume_for_path<'a>(volumes: &'a [Volume], path: &str) -> Option<&'a Volume> {
    volumes
        .iter()
        .filter(|v| {
            path.strip_prefix(v.mount_point.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
        .max_by_key(|v| v.mount_point.len())
}

/// Is anything mounted at `mount_point`, according to a `/proc/mounts` listing?
pub fn mounted_at<R: BufRead>(listing: R, mount_point: &str) -> bool {
    listing.lines().map_while(Result::ok).any(|line| {
        let mut fields = line.split_whitespace();
        fields.nth(1) == Some(mount_point)
    })
}

/// The volume directory service: every operation is keyed by a path under some volume.
pub trait Volumes {
    /// The volume containing `path`, if there is one
    fn lookup(&self, path: &str) -> Option<&Volume>;

    fn is_mounted(&self, path: &str) -> bool;

    /// Mount the volume containing `path`, unless it already is.
    fn ensure_mounted(&mut self, path: &str) -> anyhow::Result<()>;

    /// Unmount the volume containing `path`, unless it already is.
    fn ensure_unmounted(&mut self, path: &str) -> anyhow::Result<()>;

    /// Erase the volume containing `path`, leaving it empty and unmounted.
    fn format(&mut self, path: &str) -> anyhow::Result<()>;

    fn has_volume(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }
}

/// `Volumes` backed by the kernel: real mounts, real devices.
#[derive(Debug)]
pub struct SystemVolumes {
    table: Vec<Volume>,
}

impl SystemVolumes {
    pub fn new(table: Vec<Volume>) -> Self {
        Self { table }
    }

    /// Read the volume table from an fstab file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
        let table = parse_fstab(&text)?;
        log::info!("loaded {} volumes from {}", table.len(), path.display());
        Ok(Self::new(table))
    }

    fn volume(&self, path: &str) -> anyhow::Result<&Volume> {
        self.lookup(path)
            .ok_or_else(|| anyhow!("unknown volume for path {path}"))
    }

    /// The block device to mount for a volume
    fn mount_source(volume: &Volume) -> anyhow::Result<String> {
        if volume.fs_type == "yaffs2" {
            let index = crate::flash::mtd::lookup_index(&volume.device)?;
            Ok(crate::flash::mtd::block_device(index)
                .to_string_lossy()
                .into_owned())
        } else {
            Ok(volume.device.clone())
        }
    }

    fn mount_volume(volume: &Volume) -> anyhow::Result<()> {
        let target = Path::new(&volume.mount_point);
        if !target.is_dir() {
            fs::create_dir_all(target)?;
        }

        let source = Self::mount_source(volume)?;
        let flags = MsFlags::MS_NOATIME | MsFlags::MS_NODEV | MsFlags::MS_NODIRATIME;

        // Removable media may still be settling; only a missing device is worth waiting for
        let outcome = retry(Fixed::from_millis(100).take(10), || {
            match mount(
                Some(source.as_str()),
                target,
                Some(volume.fs_type.as_str()),
                flags,
                None::<&str>,
            ) {
                Err(errno @ (Errno::ENOENT | Errno::ENXIO)) => Err(errno),
                other => Ok(other),
            }
        })
        .unwrap_or_else(|e| Err(e.error));

        match outcome {
            // Ignore EBUSY, which indicates that the mountpoint is already mounted.
            Ok(()) | Err(Errno::EBUSY) => Ok(()),
            Err(errno) => {
                Err(errno).with_context(|| format!("mounting {source} at {}", volume.mount_point))
            }
        }
    }
}

impl Volumes for SystemVolumes {
    fn lookup(&self, path: &str) -> Option<&Volume> {
        volume_for_path(&self.table, path)
    }

    fn is_mounted(&self, path: &str) -> bool {
        let Some(volume) = self.lookup(path) else {
            return false;
        };
        match File::open("/proc/mounts") {
            Ok(file) => mounted_at(BufReader::new(file), &volume.mount_point),
            Err(e) => {
                log::warn!("cannot read /proc/mounts: {e}");
                false
            }
        }
    }

    fn ensure_mounted(&mut self, path: &str) -> anyhow::Result<()> {
        let volume = self.volume(path)?;
        if volume.is_raw() {
            bail!("{} is a raw partition and cannot be mounted", volume.mount_point);
        }
        if self.is_mounted(path) {
            return Ok(());
        }

        log::debug!("mounting {}", volume.mount_point);
        Self::mount_volume(volume)
    }

    fn ensure_unmounted(&mut self, path: &str) -> anyhow::Result<()> {
        let volume = self.volume(path)?;
        if volume.is_raw() || !self.is_mounted(path) {
            return Ok(());
        }

        log::debug!("unmounting {}", volume.mount_point);
        umount(volume.mount_point.as_str())
            .with_context(|| format!("unmounting {}", volume.mount_point))
    }

    fn format(&mut self, path: &str) -> anyhow::Result<()> {
        self.ensure_unmounted(path)?;
        let volume = self.volume(path)?.clone();

        match volume.fs_type.as_str() {
            "mtd" | "yaffs2" => {
                let mut nand = crate::flash::mtd::MtdNand::open_named(&volume.device)?;
                let erased = crate::flash::image::erase_all(&mut nand)?;
                log::info!("erased {erased} blocks of {}", volume.device);
                Ok(())
            }
            "emmc" => {
                // Raw eMMC images are overwritten in full on restore
                log::debug!("nothing to erase on raw partition {}", volume.device);
                Ok(())
            }
            fs_type => {
                let cmdline = match fs_type {
                    "vfat" => format!("mkfs.vfat {}", shell_quote(&volume.device)),
                    _ => format!(
                        "mke2fs -F -t {} {}",
                        shell_quote(fs_type),
                        shell_quote(&volume.device)
                    ),
                };
                let status = ShellRunner.run(&cmdline)?;
                if status != 0 {
                    bail!("formatting {} failed with status {status}", volume.mount_point);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
const TEST_FSTAB: &str = "\
# mount point   fstype   device                 [device2]
/boot           mtd      boot
/cache          yaffs2   cache
/data           ext4     /dev/block/mmcblk0p2
/sdcard         vfat     /dev/block/mmcblk1p1   /dev/block/mmcblk1
/sdcard/.android_secure  vfat  /dev/block/mmcblk1p2
";

#[test]
fn test_parse_fstab() -> anyhow::Result<()> {
    let volumes = parse_fstab(TEST_FSTAB)?;
    assert_eq!(volumes.len(), 5);
    assert_eq!(
        volumes[3],
        Volume {
            mount_point: "/sdcard".into(),
            fs_type: "vfat".into(),
            device: "/dev/block/mmcblk1p1".into(),
            device2: Some("/dev/block/mmcblk1".into()),
        }
    );
    assert!(volumes[0].is_raw());
    assert!(!volumes[1].is_raw());
    assert_eq!(volumes[2].device_name(), "mmcblk0p2");

    assert!(parse_fstab("/system ext4").is_err());
    assert!(parse_fstab("system ext4 /dev/block/mmcblk0p1").is_err());
    Ok(())
}

#[test]
fn test_volume_for_path() -> anyhow::Result<()> {
    let volumes = parse_fstab(TEST_FSTAB)?;
    let mount_point = |path| volume_for_path(&volumes, path).map(|v| v.mount_point.as_str());

    assert_eq!(mount_point("/cache"), Some("/cache"));
    assert_eq!(mount_point("/cache/recovery_config.dat"), Some("/cache"));
    assert_eq!(mount_point("/sdcard/nandroid/2024"), Some("/sdcard"));
    assert_eq!(mount_point("/sdcard/.android_secure/x"), Some("/sdcard/.android_secure"));
    assert_eq!(mount_point("/cachedir"), None);
    assert_eq!(mount_point("/system"), None);
    Ok(())
}

#[test]
fn test_mounted_at() {
    let listing = "\
rootfs / rootfs rw 0 0
/dev/block/mtdblock4 /cache yaffs2 rw,nodev,noatime 0 0
/dev/block/mmcblk1p1 /sdcard vfat rw 0 0
";
    assert!(mounted_at(listing.as_bytes(), "/cache"));
    assert!(mounted_at(listing.as_bytes(), "/sdcard"));
    assert!(!mounted_at(listing.as_bytes(), "/data"));
}
