//! Fakes for the session's services, so screens and the nandroid engine can be tested without a
//! console, devices or external programs.

use std::cell::{Cell, RefCell};
use std::collections::{HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};

use crate::config::RecoveryConfig;
use crate::exec::CommandRunner;
use crate::flash::RawFlash;
use crate::partition::PartitionTable;
use crate::session::Session;
use crate::ui::{Display, Selection};
use crate::volume::{parse_fstab, volume_for_path, Volume, Volumes};

/// One menu as it was shown: headers, items, initial index
pub type Shown = (Vec<String>, Vec<String>, usize);

/// A display that answers menus from a script (then "back" forever) and records everything.
pub struct ScriptedDisplay {
    answers: RefCell<VecDeque<Selection>>,
    shown: RefCell<Vec<Shown>>,
    printed: RefCell<Vec<String>>,
    progress: RefCell<Vec<String>>,
    held: RefCell<HashSet<u16>>,
    visible: Cell<bool>,
}

impl ScriptedDisplay {
    pub fn new<I: IntoIterator<Item = Selection>>(answers: I) -> Self {
        Self {
            answers: RefCell::new(answers.into_iter().collect()),
            shown: RefCell::default(),
            printed: RefCell::default(),
            progress: RefCell::default(),
            held: RefCell::default(),
            visible: Cell::new(true),
        }
    }

    pub fn shown(&self) -> Vec<Shown> {
        self.shown.borrow().clone()
    }

    /// Item titles of every menu shown, in order
    pub fn shown_items(&self) -> Vec<Vec<String>> {
        self.shown.borrow().iter().map(|s| s.1.clone()).collect()
    }

    pub fn printed(&self) -> Vec<String> {
        self.printed.borrow().clone()
    }

    /// Everything printed, as one string
    pub fn output(&self) -> String {
        self.printed.borrow().concat()
    }

    pub fn progress_log(&self) -> Vec<String> {
        self.progress.borrow().clone()
    }

    pub fn hold(&self, code: u16) {
        self.held.borrow_mut().insert(code);
    }

    pub fn set_text_visible(&self, visible: bool) {
        self.visible.set(visible);
    }
}

impl Display for ScriptedDisplay {
    fn select(&self, headers: &[String], items: &[String], initial: usize) -> Selection {
        self.shown
            .borrow_mut()
            .push((headers.to_vec(), items.to_vec(), initial));
        self.answers.borrow_mut().pop_front().unwrap_or(Selection::Back)
    }

    fn print(&self, text: &str) {
        self.printed.borrow_mut().push(text.to_string());
    }

    fn show_progress(&self, portion: f32, seconds: u32) {
        self.progress
            .borrow_mut()
            .push(format!("show {portion} {seconds}"));
    }

    fn set_progress(&self, fraction: f32) {
        self.progress.borrow_mut().push(format!("set {fraction}"));
    }

    fn show_indeterminate_progress(&self) {
        self.progress.borrow_mut().push("indeterminate".into());
    }

    fn reset_progress(&self) {
        self.progress.borrow_mut().push("reset".into());
    }

    fn text_visible(&self) -> bool {
        self.visible.get()
    }

    fn key_pressed(&self, code: u16) -> bool {
        self.held.borrow().contains(&code)
    }
}

pub const TEST_FSTAB: &str = "\
/boot      mtd   boot
/system    ext4  /dev/block/mmcblk0p1
/data      ext4  /dev/block/mmcblk0p2
/cache     ext4  /dev/block/mmcblk0p3
/sdcard    vfat  /dev/block/mmcblk1p1
/recovery  emmc  /dev/block/mmcblk0p4
";

/// Volumes that only exist in memory. Paths outside every volume are host paths (temporary
/// directories) and count as always mounted.
#[derive(Debug, Default)]
pub struct FakeVolumes {
    table: Vec<Volume>,
    mounted: HashSet<String>,
    failing: HashSet<String>,
    /// "mount /x", "unmount /x" and "format /x", in the order they happened
    pub events: Vec<String>,
}

impl FakeVolumes {
    pub fn new(fstab: &str) -> Self {
        Self {
            table: parse_fstab(fstab).expect("test fstab should parse"),
            ..Default::default()
        }
    }

    pub fn mounted(mut self, mount_point: &str) -> Self {
        self.mounted.insert(mount_point.to_string());
        self
    }

    /// Make formatting (and mounting) this volume fail
    pub fn fail(&mut self, mount_point: &str) {
        self.failing.insert(mount_point.to_string());
    }

    fn volume(&self, path: &str) -> Option<Volume> {
        volume_for_path(&self.table, path).cloned()
    }
}

impl Volumes for FakeVolumes {
    fn lookup(&self, path: &str) -> Option<&Volume> {
        volume_for_path(&self.table, path)
    }

    fn is_mounted(&self, path: &str) -> bool {
        match self.volume(path) {
            Some(v) => self.mounted.contains(&v.mount_point),
            None => true,
        }
    }

    fn ensure_mounted(&mut self, path: &str) -> anyhow::Result<()> {
        let Some(v) = self.volume(path) else {
            return Ok(());
        };
        anyhow::ensure!(!v.is_raw(), "{} is raw", v.mount_point);
        anyhow::ensure!(!self.failing.contains(&v.mount_point), "mount failed");
        if self.mounted.insert(v.mount_point.clone()) {
            self.events.push(format!("mount {}", v.mount_point));
        }
        Ok(())
    }

    fn ensure_unmounted(&mut self, path: &str) -> anyhow::Result<()> {
        let Some(v) = self.volume(path) else {
            return Ok(());
        };
        if self.mounted.remove(&v.mount_point) {
            self.events.push(format!("unmount {}", v.mount_point));
        }
        Ok(())
    }

    fn format(&mut self, path: &str) -> anyhow::Result<()> {
        let v = self
            .volume(path)
            .ok_or_else(|| anyhow::anyhow!("unknown volume for path {path}"))?;
        anyhow::ensure!(!self.failing.contains(&v.mount_point), "format failed");
        self.ensure_unmounted(path)?;
        self.events.push(format!("format {}", v.mount_point));
        Ok(())
    }
}

/// Records command lines instead of running them
pub struct FakeRunner {
    pub commands: Vec<String>,
    status: Box<dyn FnMut(&str) -> i32>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self::with_status(|_| 0)
    }
}

impl FakeRunner {
    pub fn with_status<F: FnMut(&str) -> i32 + 'static>(status: F) -> Self {
        Self {
            commands: Vec::new(),
            status: Box::new(status),
        }
    }
}

impl CommandRunner for FakeRunner {
    fn run(&mut self, cmdline: &str) -> io::Result<i32> {
        self.commands.push(cmdline.to_string());
        Ok((self.status)(cmdline))
    }

    fn run_scripted(&mut self, argv: &[&str], _ui: &dyn Display) -> io::Result<i32> {
        let cmdline = argv.join(" ");
        self.commands.push(cmdline.clone());
        Ok((self.status)(&cmdline))
    }
}

#[derive(Debug, Default)]
pub struct FakeFlash {
    pub backups: Vec<(String, PathBuf)>,
    pub restores: Vec<(String, PathBuf)>,
    pub fail: bool,
}

impl RawFlash for FakeFlash {
    fn backup(&mut self, device: &str, image: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail, "flash failure");
        self.backups.push((device.to_string(), image.to_path_buf()));
        Ok(())
    }

    fn restore(&mut self, device: &str, image: &Path) -> anyhow::Result<()> {
        anyhow::ensure!(!self.fail, "flash failure");
        self.restores.push((device.to_string(), image.to_path_buf()));
        Ok(())
    }
}

/// A complete set of fakes, from which sessions can be borrowed
pub struct TestRig {
    pub ui: ScriptedDisplay,
    pub volumes: FakeVolumes,
    pub runner: FakeRunner,
    pub flash: FakeFlash,
    pub config: RecoveryConfig,
    pub partitions: PartitionTable,
}

impl TestRig {
    pub fn new<I: IntoIterator<Item = Selection>>(answers: I) -> Self {
        Self {
            ui: ScriptedDisplay::new(answers),
            volumes: FakeVolumes::new(TEST_FSTAB),
            runner: FakeRunner::default(),
            flash: FakeFlash::default(),
            config: RecoveryConfig::default(),
            partitions: PartitionTable::builtin(),
        }
    }

    pub fn volumes_lookup(&self, path: &str) -> Volume {
        self.volumes
            .lookup(path)
            .cloned()
            .expect("path should be in the test fstab")
    }

    pub fn session(&mut self) -> Session<'_> {
        Session {
            ui: &self.ui,
            volumes: &mut self.volumes,
            runner: &mut self.runner,
            flash: &mut self.flash,
            config: &mut self.config,
            partitions: &self.partitions,
        }
    }
}
