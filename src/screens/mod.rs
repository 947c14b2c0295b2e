//! The recovery's menus, from the main menu down.

pub mod install;
pub mod mount;
pub mod nandroid;
pub mod options;
pub mod wipe;

use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::session::Session;
use crate::ui::{prepend_title, Display, Selection};

/// How the session ends
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PowerAction {
    Reboot,
    RebootRecovery,
    PowerOff,
}

/// Position of the "yes" answer in a confirmation dialog
const CONFIRM_YES: usize = 7;
const CONFIRM_ITEMS: usize = 11;

/// Ask before doing something irreversible. Only the one "yes" item among the "no"s confirms.
pub fn confirm(ui: &dyn Display, question: &str, yes: &str) -> bool {
    let headers = prepend_title(&[question, "THIS CAN NOT BE UNDONE.", ""]);
    let items: Vec<String> = (0..CONFIRM_ITEMS)
        .map(|i| {
            if i == CONFIRM_YES {
                yes.to_string()
            } else {
                " No".to_string()
            }
        })
        .collect();
    ui.select(&headers, &items, 0) == Selection::Index(CONFIRM_YES)
}

const HELP: &str = "\n\n\nHELP/FEATURES:\n\
Wipe menu: wipes any partition on the device,\n\
also includes battery statistics wipe\n\
Mount menu: (un)mount partitions, USB mass storage\n\
Backup/restore: nandroid backups under /sdcard/nandroid\n\
and /sdcard/clockworkmod/backup\n\
Install: update.zip, rom.tar/tgz scripted installs,\n\
kernel and recovery images\n\
\nRecovery images must be in /sdcard/recovery &\n\
end in either -rec.img, _rec.img, .rec.img\n\
\nKernel images must be in /sdcard/kernels &\n\
end in boot.img\n";

const ITEM_REBOOT: ItemId = 0;
const ITEM_RECOVERY: ItemId = 1;
const ITEM_POWEROFF: ItemId = 2;
const ITEM_WIPE: ItemId = 3;
const ITEM_MOUNT: ItemId = 4;
const ITEM_NANDROID: ItemId = 5;
const ITEM_INSTALL: ItemId = 6;
const ITEM_OPTIONS: ItemId = 7;
const ITEM_HELP: ItemId = 8;

struct MainMenu<'s, 'a> {
    session: &'s mut Session<'a>,
    action: Option<PowerAction>,
}

impl MainMenu<'_, '_> {
    fn power(&mut self, action: PowerAction, message: &str) -> Choice {
        self.session.say(format!("\n\n{message}"));
        self.action = Some(action);
        Choice::Back
    }
}

impl MenuHandler for MainMenu<'_, '_> {
    fn on_create(&mut self) {
        self.session.ui.reset_progress();
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        let session = &mut *self.session;
        match choice {
            Choice::Item(ITEM_REBOOT) => {
                return self.power(PowerAction::Reboot, "Rebooting Android...\n")
            }
            Choice::Item(ITEM_RECOVERY) => {
                return self.power(PowerAction::RebootRecovery, "Rebooting Recovery...\n")
            }
            Choice::Item(ITEM_POWEROFF) => {
                return self.power(PowerAction::PowerOff, "Shutting down...\n")
            }
            Choice::Item(ITEM_WIPE) => wipe::show_wipe_menu(session),
            Choice::Item(ITEM_MOUNT) => mount::show_mount_menu(session),
            Choice::Item(ITEM_NANDROID) => nandroid::show_nandroid_menu(session),
            Choice::Item(ITEM_INSTALL) => install::show_install_menu(session),
            Choice::Item(ITEM_OPTIONS) => options::show_options_menu(session),
            Choice::Item(ITEM_HELP) => session.say(HELP),
            // There is nowhere to go back to
            _ => (),
        }
        session.ui.reset_progress();
        Choice::Continue
    }
}

/// Run the main menu until the operator picks a way to leave recovery.
pub fn prompt_and_wait(session: &mut Session) -> PowerAction {
    let ui = session.ui;
    let mut menu = MainMenu {
        session,
        action: None,
    };

    let items = vec![
        MenuItem::new(ITEM_REBOOT, "Reboot into Android"),
        MenuItem::new(ITEM_RECOVERY, "Reboot into Recovery"),
        MenuItem::new(ITEM_POWEROFF, "Shutdown system"),
        MenuItem::new(ITEM_WIPE, "Wipe partitions"),
        MenuItem::new(ITEM_MOUNT, "Mount options"),
        MenuItem::new(ITEM_NANDROID, "Backup/restore"),
        MenuItem::new(ITEM_INSTALL, "Install"),
        MenuItem::new(ITEM_OPTIONS, "Options"),
        MenuItem::new(ITEM_HELP, "Help"),
    ];
    Menu::new(&["Use the arrow keys to navigate,", "select to choose", ""])
        .items(items)
        .handler(&mut menu)
        .display(ui);

    let action = menu.action.unwrap_or(PowerAction::Reboot);
    log::info!("leaving recovery: {action:?}");
    action
}

#[cfg(test)]
use crate::testutil::{ScriptedDisplay, TestRig};

#[test]
fn test_confirm() {
    let ui = ScriptedDisplay::new([Selection::Index(7), Selection::Index(6), Selection::Back]);
    assert!(confirm(&ui, "Confirm wipe of cache?", " Yes -- wipe cache"));
    assert!(!confirm(&ui, "Confirm wipe of cache?", " Yes -- wipe cache"));
    assert!(!confirm(&ui, "Confirm wipe of cache?", " Yes -- wipe cache"));

    let shown = ui.shown();
    let (headers, items, _) = &shown[0];
    assert_eq!(items.len(), 11);
    assert_eq!(items[7], " Yes -- wipe cache");
    assert_eq!(items.iter().filter(|i| *i == " No").count(), 10);
    assert!(headers.contains(&"THIS CAN NOT BE UNDONE.".to_string()));
}

#[test]
fn test_main_menu() {
    // Back is ignored, help prints, then power off
    let mut rig = TestRig::new([
        Selection::Back,
        Selection::Index(8),
        Selection::Index(2),
    ]);
    let action = prompt_and_wait(&mut rig.session());

    assert_eq!(action, PowerAction::PowerOff);
    let shown = rig.ui.shown();
    assert_eq!(shown.len(), 3);
    assert_eq!(shown[0].1.len(), 9);
    // The menu comes back where the operator left it
    assert_eq!(shown[2].2, 8);
    assert!(rig.ui.output().contains("HELP/FEATURES"));
    assert!(rig.ui.output().ends_with("Shutting down...\n"));
}
