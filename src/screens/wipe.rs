use std::fs;
use std::io;

use super::confirm;
use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::session::Session;

/// Android's battery statistics, reset by "Wipe battery stats"
pub const BATTERY_STATS: &str = "/data/system/batterystats.bin";

// Partition ids are item ids; these sit above any of them
const ITEM_WIPE_ALL: ItemId = 1000;
const ITEM_WIPE_BATT: ItemId = 1001;

/// Wiped along with data whenever the device has it
const DATADATA: &str = "datadata";

fn wipe_one(session: &mut Session, name: &str, path: &str) {
    session.say(format!("---- Wiping {name} ----\n"));
    match session.volumes.format(path) {
        Ok(()) => session.say("     complete\n"),
        Err(e) => {
            log::warn!("wiping {path}: {e:#}");
            session.say(format!("     error ({e:#})\n"));
        }
    }
}

/// Wipe one partition by id (data takes datadata with it), or all wipeable partitions. Asks
/// first if `ask` is set.
pub fn wipe_partition(session: &mut Session, which: Option<usize>, ask: bool) {
    let partitions = session.partitions;
    let target = match which {
        Some(id) => match partitions.get(id) {
            Some(p) if p.flags.wipeable && session.volumes.has_volume(&p.path) => Some(p),
            _ => {
                log::error!("invalid partition {id} specified in wipe");
                return;
            }
        },
        None => None,
    };

    if ask {
        let (question, yes) = match target {
            Some(p) => (
                format!("Confirm wipe of {}?", p.name),
                format!(" Yes -- wipe {}", p.name),
            ),
            None => (
                "Confirm wipe of EVERYTHING?".to_string(),
                " Yes -- wipe EVERYTHING".to_string(),
            ),
        };
        if !confirm(session.ui, &question, &yes) {
            return;
        }
    }

    match target {
        Some(p) => {
            wipe_one(session, &p.name, &p.path);
            if p.name == "data" {
                if let Some(dd) = partitions
                    .by_name(DATADATA)
                    .filter(|dd| dd.flags.wipeable && session.volumes.has_volume(&dd.path))
                {
                    wipe_one(session, &dd.name, &dd.path);
                }
            }
        }
        None => {
            for p in partitions.iter() {
                if p.flags.wipeable && session.volumes.has_volume(&p.path) {
                    wipe_one(session, &p.name, &p.path);
                }
            }
        }
    }
}

pub fn wipe_battery_stats(session: &mut Session, ask: bool) {
    if ask && !confirm(session.ui, "Confirm wipe of battery stats?", " Yes -- Wipe battery stats")
    {
        return;
    }

    session.say("\n-- Wiping battery stats...\n");
    if let Err(e) = session.volumes.ensure_mounted("/data") {
        session.say(format!("Cannot mount /data ({e:#})\n"));
        return;
    }
    match fs::remove_file(BATTERY_STATS) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            session.say(format!("Cannot remove {BATTERY_STATS} ({e})\n"));
        }
        _ => session.say("\n Battery Statistics cleared.\n"),
    }
}

struct WipeMenu<'s, 'a> {
    session: &'s mut Session<'a>,
}

impl MenuHandler for WipeMenu<'_, '_> {
    fn on_select(&mut self, choice: Choice) -> Choice {
        // Confirmation needs the text display to be seen
        let ask = self.session.ui.text_visible();
        match choice {
            Choice::Item(ITEM_WIPE_ALL) => wipe_partition(self.session, None, ask),
            Choice::Item(ITEM_WIPE_BATT) => wipe_battery_stats(self.session, ask),
            Choice::Item(id) => wipe_partition(self.session, Some(id as usize), ask),
            _ => (),
        }
        choice
    }
}

pub fn show_wipe_menu(session: &mut Session) {
    let mut items = vec![MenuItem::new(ITEM_WIPE_ALL, "Wipe All")];
    items.extend(
        session
            .partitions
            .iter()
            .filter(|p| p.name != DATADATA)
            .filter(|p| p.flags.wipeable && session.volumes.has_volume(&p.path))
            .map(|p| MenuItem::new(p.id as ItemId, format!("Wipe {}", p.name))),
    );
    items.push(MenuItem::new(ITEM_WIPE_BATT, "Wipe battery stats"));

    let ui = session.ui;
    let mut handler = WipeMenu { session };
    Menu::new(&[
        "Choose an item to wipe",
        "or press DEL or POWER to return",
        "USE CAUTION:",
        "These operations *CANNOT BE UNDONE*",
        "",
    ])
    .items(items)
    .handler(&mut handler)
    .display(ui);
}

#[cfg(test)]
use crate::testutil::{FakeVolumes, TestRig, TEST_FSTAB};

#[cfg(test)]
use crate::ui::Selection;

#[test]
fn test_wipe_menu_items() {
    let mut rig = TestRig::new([]);
    show_wipe_menu(&mut rig.session());

    assert_eq!(
        rig.ui.shown_items()[0],
        [
            "Wipe All",
            "Wipe boot",
            "Wipe system",
            "Wipe data",
            "Wipe cache",
            "Wipe sdcard",
            "Wipe battery stats"
        ]
    );
}

#[test]
fn test_wipe_data_takes_datadata() {
    let fstab = format!("{TEST_FSTAB}/datadata yaffs2 datadata\n");
    // Wipe data, decline; wipe data, confirm
    let mut rig = TestRig::new([
        Selection::Index(3),
        Selection::Index(0),
        Selection::Index(3),
        Selection::Index(7),
    ]);
    rig.volumes = FakeVolumes::new(&fstab);
    show_wipe_menu(&mut rig.session());

    assert_eq!(rig.volumes.events, ["format /data", "format /datadata"]);
    let output = rig.ui.output();
    assert!(output.contains("---- Wiping data ----\n     complete\n"));
    assert!(output.contains("---- Wiping datadata ----\n"));
    // The datadata item itself is hidden
    assert!(!rig.ui.shown_items()[0].contains(&"Wipe datadata".to_string()));
}

#[test]
fn test_wipe_all_without_text() {
    let mut rig = TestRig::new([Selection::Index(0)]);
    rig.ui.set_text_visible(false);
    show_wipe_menu(&mut rig.session());

    // No confirmation dialog when nobody can read it
    assert_eq!(rig.ui.shown().len(), 2);
    assert_eq!(
        rig.volumes.events,
        [
            "format /boot",
            "format /system",
            "format /data",
            "format /cache",
            "format /sdcard"
        ]
    );
}
