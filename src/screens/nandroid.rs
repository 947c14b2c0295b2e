//! Backup and restore menus over the nandroid engine.

use std::path::{Path, PathBuf};

use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::nandroid::{self, Bundle, NandroidError, PartitionMark, Report, NANDROID_DIRS};
use crate::session::Session;

// Partition ids are item ids; these sit above any of them
const ITEM_GO: ItemId = 1000;
const ITEM_SELECT: ItemId = 1001;

const ITEM_SIMPLE_BACKUP: ItemId = 0;
const ITEM_SIMPLE_RESTORE: ItemId = 1;
const ITEM_ADV_BACKUP: ItemId = 2;
const ITEM_ADV_RESTORE: ItemId = 3;

/// Where new backups go and where existing ones are looked for
#[derive(Debug, Clone)]
pub struct NandroidPaths {
    pub backup_root: PathBuf,
    pub scan_roots: Vec<PathBuf>,
}

impl Default for NandroidPaths {
    fn default() -> Self {
        Self {
            backup_root: PathBuf::from(NANDROID_DIRS[0]),
            scan_roots: NANDROID_DIRS.iter().map(PathBuf::from).collect(),
        }
    }
}

impl NandroidPaths {
    /// The usual layout, on an SD card mounted somewhere else
    pub fn under<P: AsRef<Path>>(sdcard: P) -> Self {
        let sdcard = sdcard.as_ref();
        Self {
            backup_root: sdcard.join("nandroid"),
            scan_roots: vec![
                sdcard.join("nandroid"),
                sdcard.join("clockworkmod/backup"),
            ],
        }
    }

    /// A fresh directory name for a backup taken now, optionally tagged with why
    pub fn new_backup_dir(&self, tag: Option<&str>) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y-%m-%d.%H.%M.%S");
        match tag {
            Some(tag) => self.backup_root.join(format!("{stamp}-{tag}")),
            None => self.backup_root.join(stamp.to_string()),
        }
    }
}

/// Tell the operator how a bulk operation went. The engine has already logged each partition.
fn report_outcome(session: &Session, what: &str, result: &Result<Report, NandroidError>) {
    match result {
        Ok(report) if report.succeeded() => session.say("(done)\n"),
        Ok(report) => session.say(format!(
            "Nandroid {what} finished with {} failed partitions\n",
            report.failures()
        )),
        Err(e) => {
            log::error!("nandroid {what} aborted: {e}");
            session.say(format!("Nandroid {what} aborted\n"));
        }
    }
}

/// Back up `ids` (or every saveable partition) into a new timestamped directory.
pub fn backup_now(
    session: &mut Session,
    paths: &NandroidPaths,
    tag: Option<&str>,
    ids: Option<&[usize]>,
) {
    let dir = paths.new_backup_dir(tag);
    session.say(format!("Attempting Nandroid backup to {}\n", dir.display()));
    let result = nandroid::backup(session, &dir, ids);
    report_outcome(session, "backup", &result);
}

fn restore_bundle(session: &mut Session, bundle: &Bundle, ids: Option<&[usize]>) {
    session.say(format!("Restoring {}...\n", bundle.name()));
    let result = nandroid::restore(session, &bundle.dir, ids);
    report_outcome(session, "restore", &result);
}

/// Every backup under the scan roots, mounting the volumes they live on first.
pub fn scan_bundles(session: &mut Session, paths: &NandroidPaths) -> Vec<Bundle> {
    nandroid::scan_roots(session.volumes, session.partitions, &paths.scan_roots)
}

struct SelectBundle<'s, 'a, 'p> {
    session: &'s mut Session<'a>,
    paths: &'p NandroidPaths,
    bundles: Vec<Bundle>,
    chosen: Option<Bundle>,
}

impl MenuHandler for SelectBundle<'_, '_, '_> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        self.bundles = scan_bundles(self.session, self.paths);
        self.bundles
            .iter()
            .zip(0..)
            .map(|(b, id)| {
                MenuItem::new(id, format!("{} (parts: {})", b.name(), b.partitions.len()))
            })
            .collect()
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        if let Choice::Item(id) = choice {
            if let Some(bundle) = self.bundles.get(id as usize) {
                self.chosen = Some(bundle.clone());
                return Choice::Back;
            }
        }
        choice
    }
}

/// Let the operator pick one of the backups found on the card.
pub fn select_bundle(session: &mut Session, paths: &NandroidPaths) -> Option<Bundle> {
    let ui = session.ui;
    let mut handler = SelectBundle {
        session,
        paths,
        bundles: Vec::new(),
        chosen: None,
    };
    Menu::new(&["Choose a detected nandroid", ""])
        .dynamic()
        .handler(&mut handler)
        .display(ui);

    if handler.bundles.is_empty() {
        handler.session.say("No nandroid backups found\n");
    }
    handler.chosen
}

struct AdvancedBackup<'s, 'a, 'p> {
    session: &'s mut Session<'a>,
    paths: &'p NandroidPaths,
    marks: Vec<PartitionMark>,
}

impl MenuHandler for AdvancedBackup<'_, '_, '_> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        let partitions = self.session.partitions;
        let mut items = vec![MenuItem::new(ITEM_GO, "Perform backup")];
        items.extend(self.marks.iter().filter_map(|mark| {
            let part = partitions.get(mark.id)?;
            Some(MenuItem::checkbox(mark.id as ItemId, part.name.as_str(), mark.selected))
        }));
        items
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        match choice {
            Choice::Item(ITEM_GO) => {
                let ids: Vec<usize> = self
                    .marks
                    .iter()
                    .filter(|m| m.selected)
                    .map(|m| m.id)
                    .collect();
                if ids.is_empty() {
                    self.session.say("No partitions selected\n");
                    return Choice::Continue;
                }
                backup_now(self.session, self.paths, None, Some(&ids));
                Choice::Back
            }
            Choice::Item(id) => {
                if let Some(mark) = self.marks.iter_mut().find(|m| m.id == id as usize) {
                    mark.toggle();
                }
                choice
            }
            _ => choice,
        }
    }
}

fn show_advanced_backup(session: &mut Session, paths: &NandroidPaths) {
    let marks = session
        .partitions
        .iter()
        .filter(|p| p.flags.saveable && session.volumes.has_volume(&p.path))
        .map(|p| PartitionMark {
            id: p.id,
            selected: true,
        })
        .collect();

    let ui = session.ui;
    let mut handler = AdvancedBackup {
        session,
        paths,
        marks,
    };
    Menu::new(&["Select the partitions you would like to back up", ""])
        .dynamic()
        .handler(&mut handler)
        .display(ui);
}

struct AdvancedRestore<'s, 'a, 'p> {
    session: &'s mut Session<'a>,
    paths: &'p NandroidPaths,
    bundle: Option<Bundle>,
}

impl MenuHandler for AdvancedRestore<'_, '_, '_> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        let mut items = vec![MenuItem::new(ITEM_GO, "Perform restore")];
        let Some(bundle) = &self.bundle else {
            items.push(MenuItem::new(
                ITEM_SELECT,
                "Select backup: ---- NONE SELECTED ----",
            ));
            return items;
        };

        items.push(MenuItem::new(
            ITEM_SELECT,
            format!("Select backup: {}", bundle.name()),
        ));
        let volumes = &*self.session.volumes;
        items.extend(bundle.partitions.iter().filter_map(|mark| {
            let part = self
                .session
                .partitions
                .get(mark.id)
                .filter(|p| p.flags.restoreable && volumes.has_volume(&p.path))?;
            Some(MenuItem::checkbox(mark.id as ItemId, part.name.as_str(), mark.selected))
        }));
        items
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        match choice {
            Choice::Item(ITEM_GO) => {
                let Some(bundle) = &self.bundle else {
                    self.session.say("No backup selected\n");
                    return Choice::Continue;
                };
                let ids = bundle.selected();
                if ids.is_empty() {
                    self.session.say("No partitions selected\n");
                    return Choice::Continue;
                }
                restore_bundle(self.session, bundle, Some(&ids));
                Choice::Back
            }
            Choice::Item(ITEM_SELECT) => {
                if let Some(bundle) = select_bundle(self.session, self.paths) {
                    self.bundle = Some(bundle);
                }
                choice
            }
            Choice::Item(id) => {
                if let Some(bundle) = &mut self.bundle {
                    bundle.toggle(id as usize);
                }
                choice
            }
            _ => choice,
        }
    }
}

fn show_advanced_restore(session: &mut Session, paths: &NandroidPaths) {
    let ui = session.ui;
    let mut handler = AdvancedRestore {
        session,
        paths,
        bundle: None,
    };
    Menu::new(&[
        "Select the nandroid you would like to restore",
        "as well as which partitions",
        "",
    ])
    .dynamic()
    .handler(&mut handler)
    .display(ui);
}

struct NandroidMenu<'s, 'a, 'p> {
    session: &'s mut Session<'a>,
    paths: &'p NandroidPaths,
}

impl MenuHandler for NandroidMenu<'_, '_, '_> {
    fn on_select(&mut self, choice: Choice) -> Choice {
        match choice {
            Choice::Item(ITEM_SIMPLE_BACKUP) => backup_now(self.session, self.paths, None, None),
            Choice::Item(ITEM_SIMPLE_RESTORE) => {
                if let Some(bundle) = select_bundle(self.session, self.paths) {
                    restore_bundle(self.session, &bundle, None);
                }
            }
            Choice::Item(ITEM_ADV_BACKUP) => show_advanced_backup(self.session, self.paths),
            Choice::Item(ITEM_ADV_RESTORE) => show_advanced_restore(self.session, self.paths),
            _ => (),
        }
        choice
    }
}

pub fn show_nandroid_menu(session: &mut Session) {
    show_nandroid_menu_in(session, &NandroidPaths::default());
}

pub fn show_nandroid_menu_in(session: &mut Session, paths: &NandroidPaths) {
    let ui = session.ui;
    let mut handler = NandroidMenu { session, paths };
    Menu::new(&["Select an option or press POWER to return", ""])
        .items(vec![
            MenuItem::new(ITEM_SIMPLE_BACKUP, "Simple nandroid backup"),
            MenuItem::new(ITEM_SIMPLE_RESTORE, "Simple Nandroid restore"),
            MenuItem::new(ITEM_ADV_BACKUP, "Advanced Nandroid backup"),
            MenuItem::new(ITEM_ADV_RESTORE, "Advanced Nandroid restore"),
        ])
        .handler(&mut handler)
        .display(ui);
}

#[cfg(test)]
use crate::testutil::TestRig;

#[cfg(test)]
use crate::ui::Selection;

#[cfg(test)]
use std::fs;

/// An SD card holding one backup of boot and cache
#[cfg(test)]
fn card_with_backup() -> anyhow::Result<(tempfile::TempDir, PathBuf)> {
    let sdcard = tempfile::tempdir()?;
    let dir = sdcard.path().join("nandroid/2024-01-01.10.00.00");
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("boot.img"), b"boot")?;
    fs::write(dir.join("cache.tar"), b"cache")?;
    fs::write(dir.join(nandroid::MD5_MANIFEST), b"sums")?;
    Ok((sdcard, dir))
}

#[test]
fn test_simple_backup() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let paths = NandroidPaths::under(sdcard.path());
    let mut rig = TestRig::new([Selection::Index(0)]);
    show_nandroid_menu_in(&mut rig.session(), &paths);

    let made: Vec<PathBuf> = fs::read_dir(&paths.backup_root)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    assert_eq!(made.len(), 1);
    assert_eq!(rig.flash.backups, [("boot".to_string(), made[0].join("boot.img"))]);
    assert!(rig.ui.output().contains("Backing up /system ... done\n"));
    Ok(())
}

#[test]
fn test_simple_restore() -> anyhow::Result<()> {
    let (sdcard, dir) = card_with_backup()?;
    let paths = NandroidPaths::under(sdcard.path());
    let mut rig = TestRig::new([Selection::Index(1), Selection::Index(0)]);
    show_nandroid_menu_in(&mut rig.session(), &paths);

    assert_eq!(rig.ui.shown_items()[1], ["2024-01-01.10.00.00 (parts: 2)"]);
    assert_eq!(rig.flash.restores, [("boot".to_string(), dir.join("boot.img"))]);
    let extract = format!(
        "tar -xf {} -C '/cache'",
        crate::util::shell_quote(&dir.join("cache.tar").to_string_lossy())
    );
    assert!(rig.runner.commands.contains(&extract));
    let output = rig.ui.output();
    assert!(output.contains("Skipping restore of /system ... (no backup found)\n"));
    assert!(output.contains("(done)\n"));
    Ok(())
}

#[test]
fn test_advanced_restore() -> anyhow::Result<()> {
    let (sdcard, dir) = card_with_backup()?;
    let paths = NandroidPaths::under(sdcard.path());
    let mut rig = TestRig::new([
        Selection::Index(3),
        // Nothing selected yet
        Selection::Index(0),
        Selection::Index(1),
        Selection::Index(0),
        // Leave boot alone
        Selection::Index(2),
        Selection::Index(0),
    ]);
    show_nandroid_menu_in(&mut rig.session(), &paths);

    let pages = rig.ui.shown_items();
    assert_eq!(
        pages[1],
        ["Perform restore", "Select backup: ---- NONE SELECTED ----"]
    );
    assert_eq!(
        pages[4],
        [
            "Perform restore",
            "Select backup: 2024-01-01.10.00.00",
            "(*) boot",
            "(*) cache"
        ]
    );
    assert_eq!(pages[5][2], "( ) boot");

    assert!(rig.flash.restores.is_empty());
    assert_eq!(rig.volumes.events, ["format /cache", "mount /cache", "unmount /cache"]);
    assert!(rig
        .runner
        .commands
        .iter()
        .any(|c| c.ends_with("md5sum -c nandroid.md5")));
    assert!(rig.ui.output().contains("No backup selected\n"));
    assert!(dir.join("boot.img").exists());
    Ok(())
}

#[test]
fn test_advanced_backup() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let paths = NandroidPaths::under(sdcard.path());
    let mut rig = TestRig::new([
        Selection::Index(2),
        Selection::Index(1),
        Selection::Index(0),
    ]);
    show_nandroid_menu_in(&mut rig.session(), &paths);

    assert_eq!(
        rig.ui.shown_items()[1],
        [
            "Perform backup",
            "(*) boot",
            "(*) system",
            "(*) data",
            "(*) cache",
            "(*) recovery"
        ]
    );
    assert!(rig.flash.backups.is_empty());
    assert!(rig
        .runner
        .commands
        .iter()
        .any(|c| c.starts_with("dd if='/dev/block/mmcblk0p4'")));
    assert!(!rig.ui.output().contains("Backing up /boot"));
    Ok(())
}

#[test]
fn test_no_backups_found() {
    let sdcard = tempfile::tempdir().unwrap();
    let paths = NandroidPaths::under(sdcard.path());
    let mut rig = TestRig::new([Selection::Index(1)]);
    show_nandroid_menu_in(&mut rig.session(), &paths);

    // The empty chooser closes by itself
    assert_eq!(rig.ui.shown().len(), 2);
    assert!(rig.ui.output().contains("No nandroid backups found\n"));
    assert!(rig.runner.commands.is_empty());
}
