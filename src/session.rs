//! The services one recovery session runs against, and bringing up the environment they need.

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};

use std::{fs, path::Path};

use crate::config::RecoveryConfig;
use crate::exec::CommandRunner;
use crate::flash::RawFlash;
use crate::partition::PartitionTable;
use crate::ui::Display;
use crate::volume::Volumes;

/// Everything the screens and the nandroid engine act through. Built once by the binary and
/// passed down explicitly.
pub struct Session<'a> {
    pub ui: &'a dyn Display,
    pub volumes: &'a mut dyn Volumes,
    pub runner: &'a mut dyn CommandRunner,
    pub flash: &'a mut dyn RawFlash,
    pub config: &'a mut RecoveryConfig,
    pub partitions: &'a PartitionTable,
}

impl Session<'_> {
    /// Print a line to the operator's log
    pub fn say(&self, text: impl AsRef<str>) {
        self.ui.print(text.as_ref());
    }
}

/// Set up the basic environment (e.g. mount points).
pub fn setup_mounts() -> anyhow::Result<()> {
    for (mount_path, mount_type) in [
        ("/dev", "devtmpfs"),
        ("/proc", "proc"),
        ("/sys", "sysfs"),
        ("/tmp", "tmpfs"),
    ] {
        let path = Path::new(mount_path);

        if !path.is_dir() {
            fs::create_dir(path)?;
        }

        let result = mount(
            Some(mount_type),
            path,
            Some(mount_type),
            MsFlags::empty(),
            None::<&str>,
        );

        match result {
            // Ignore EBUSY, which indicates that the mountpoint is already mounted.
            Err(Errno::EBUSY) => (),
            r => r?,
        };
    }

    Ok(())
}
