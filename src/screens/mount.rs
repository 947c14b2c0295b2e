use std::fs;
use std::path::PathBuf;

use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::session::Session;

/// The USB gadget's mass storage backing file
pub const USB_LUN_FILE: &str = "/sys/devices/platform/usb_mass_storage/lun0/file";

const ITEM_USB: ItemId = 1000;

/// Disk exported when the volume table doesn't name the SD card
const DEFAULT_SDCARD_DISK: &str = "/dev/block/mmcblk0";

/// Exporting the SD card over USB, through the gadget's LUN file
#[derive(Debug, Clone)]
pub struct UsbMassStorage {
    lun_file: PathBuf,
}

impl Default for UsbMassStorage {
    fn default() -> Self {
        Self::new(USB_LUN_FILE)
    }
}

impl UsbMassStorage {
    pub fn new<P: Into<PathBuf>>(lun_file: P) -> Self {
        Self {
            lun_file: lun_file.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        fs::read(&self.lun_file).is_ok_and(|contents| contents.starts_with(b"/dev/block"))
    }

    /// The SD card leaves the recovery's hands while it is exported.
    pub fn enable(&self, session: &mut Session) {
        if let Err(e) = session.volumes.ensure_unmounted("/sdcard") {
            session.say(format!("Cannot unmount /sdcard ({e:#})\n"));
            return;
        }

        let disk = session
            .volumes
            .lookup("/sdcard")
            .map(|v| v.device2.clone().unwrap_or_else(|| v.device.clone()))
            .unwrap_or_else(|| DEFAULT_SDCARD_DISK.to_string());

        session.say("Enabling USB mass storage ... ");
        match fs::write(&self.lun_file, format!("{disk}\n")) {
            Ok(()) => session.say("complete\n"),
            Err(e) => {
                log::error!("enabling USB mass storage: {e}");
                session.say(format!("error ({e})\n"));
            }
        }
    }

    pub fn disable(&self, session: &mut Session) {
        session.say("Disabling USB mass storage ... ");
        match fs::write(&self.lun_file, "\n") {
            Ok(()) => session.say("complete\n"),
            Err(e) => {
                log::error!("disabling USB mass storage: {e}");
                session.say(format!("error ({e})\n"));
            }
        }
    }
}

struct MountMenu<'s, 'a> {
    session: &'s mut Session<'a>,
    usb: UsbMassStorage,
}

impl MountMenu<'_, '_> {
    fn toggle_mount(&mut self, id: usize) {
        let partitions = self.session.partitions;
        let Some(part) = partitions.get(id).filter(|p| p.flags.mountable) else {
            return;
        };

        let volumes = &mut *self.session.volumes;
        let (result, done) = if volumes.is_mounted(&part.path) {
            (volumes.ensure_unmounted(&part.path), "Unmounted")
        } else {
            (volumes.ensure_mounted(&part.path), "Mounted")
        };
        match result {
            Ok(()) => self.session.say(format!("{done} {}\n", part.name)),
            Err(e) => self.session.say(format!("Error: {e:#}\n")),
        }
    }
}

impl MenuHandler for MountMenu<'_, '_> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        let volumes = &*self.session.volumes;
        let mut items: Vec<MenuItem> = self
            .session
            .partitions
            .iter()
            .filter(|p| p.flags.mountable && volumes.has_volume(&p.path))
            .map(|p| {
                let verb = if volumes.is_mounted(&p.path) {
                    "Unmount"
                } else {
                    "Mount"
                };
                MenuItem::new(p.id as ItemId, format!("{verb} {}", p.name))
            })
            .collect();

        let verb = if self.usb.is_enabled() { "Disable" } else { "Enable" };
        items.push(MenuItem::new(
            ITEM_USB,
            format!("{verb} USB Mass Storage"),
        ));
        items
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        match choice {
            Choice::Item(ITEM_USB) => {
                if self.usb.is_enabled() {
                    self.usb.disable(self.session);
                } else {
                    self.usb.enable(self.session);
                }
            }
            Choice::Item(id) => self.toggle_mount(id as usize),
            _ => (),
        }
        choice
    }
}

pub fn show_mount_menu(session: &mut Session) {
    show_mount_menu_with(session, UsbMassStorage::default());
}

pub fn show_mount_menu_with(session: &mut Session, usb: UsbMassStorage) {
    let ui = session.ui;
    let mut handler = MountMenu { session, usb };
    Menu::new(&[
        "Choose a mount or unmount option",
        "or press DEL or POWER to return",
        "",
    ])
    .dynamic()
    .handler(&mut handler)
    .display(ui);
}

#[cfg(test)]
use crate::testutil::{FakeVolumes, TestRig};

#[cfg(test)]
use crate::ui::Selection;

#[test]
fn test_mount_menu() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let lun = dir.path().join("file");
    fs::write(&lun, "\n")?;

    // Mount system, export the SD card, stop exporting it
    let mut rig = TestRig::new([
        Selection::Index(0),
        Selection::Index(4),
        Selection::Index(4),
    ]);
    rig.volumes = std::mem::take(&mut rig.volumes).mounted("/sdcard");
    show_mount_menu_with(&mut rig.session(), UsbMassStorage::new(&lun));

    let pages = rig.ui.shown_items();
    assert_eq!(
        pages[0],
        [
            "Mount system",
            "Mount data",
            "Mount cache",
            "Unmount sdcard",
            "Enable USB Mass Storage"
        ]
    );
    assert_eq!(pages[1][0], "Unmount system");
    assert_eq!(pages[2][3], "Mount sdcard");
    assert_eq!(pages[2][4], "Disable USB Mass Storage");
    assert_eq!(pages[3][4], "Enable USB Mass Storage");

    assert_eq!(fs::read_to_string(&lun)?, "\n");
    assert_eq!(rig.volumes.events, ["mount /system", "unmount /sdcard"]);
    let output = rig.ui.output();
    assert!(output.contains("Mounted system\n"));
    assert!(output.contains("Enabling USB mass storage ... complete\n"));
    Ok(())
}

#[test]
fn test_usb_exports_whole_disk() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let usb = UsbMassStorage::new(dir.path().join("file"));
    assert!(!usb.is_enabled());

    let mut rig = TestRig::new([]);
    rig.volumes = FakeVolumes::new("/sdcard vfat /dev/block/mmcblk1p1 /dev/block/mmcblk1");
    usb.enable(&mut rig.session());
    assert!(usb.is_enabled());
    assert_eq!(
        fs::read_to_string(dir.path().join("file"))?,
        "/dev/block/mmcblk1\n"
    );
    Ok(())
}
