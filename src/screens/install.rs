use evdev::Key;

use std::path::{Path, PathBuf};

use super::nandroid::{backup_now, NandroidPaths};
use crate::menu::file_select::display_file_select_menu;
use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::session::Session;

/// Runs scripted ROM installs (and the nandroid scripts of old)
pub const NANDROID_MOBILE: &str = "/sbin/nandroid-mobile.sh";
/// Installs an update package, verifying its signature on request
pub const INSTALL_PACKAGE: &str = "/sbin/install-package";

const SDCARD: &str = "/sdcard";

const ITEM_TAR: ItemId = 1;
const ITEM_ZIP: ItemId = 2;
const ITEM_KERNEL: ItemId = 3;
const ITEM_RECOVERY: ItemId = 4;

const ZIP_EXTS: &[&str] = &[".zip"];
const TAR_EXTS: &[&str] = &[".rom.tgz", ".rom.tar.gz", ".rom.tar"];
const KERNEL_EXTS: &[&str] = &["boot.img"];
const RECOVERY_EXTS: &[&str] = &["-rec.img", "_rec.img", ".rec.img"];

fn install_rom_from_tar(session: &mut Session, nandroid: &NandroidPaths, file: &Path) {
    if session.ui.key_pressed(Key::KEY_SPACE.code()) {
        session.say("Backing up before installing...\n");
        backup_now(session, nandroid, Some("preinstall"), None);
    }

    let file = file.to_string_lossy();
    session.say(format!("Attempting to install ROM from {file}...\n"));

    let argv = [NANDROID_MOBILE, "--install-rom", &*file, "--progress"];
    match session.runner.run_scripted(&argv, session.ui) {
        Ok(0) => session.say("(done)\n"),
        Ok(status) => session.say(format!("ERROR: install exited with status {status}\n")),
        Err(e) => {
            log::error!("running {NANDROID_MOBILE}: {e}");
            session.say(format!("ERROR: cannot run installer ({e})\n"));
        }
    }
    session.ui.reset_progress();
}

fn install_update_zip(session: &mut Session, file: &Path) {
    let file = file.to_string_lossy();
    session.say("\n-- Install update.zip from sdcard...\n");
    session.say(format!("Attempting update from...\n{file}\n"));

    let mut argv = vec![INSTALL_PACKAGE];
    if session.config.install_do_signature_verification {
        argv.push("--verify");
    }
    argv.push(&*file);

    match session.runner.run_scripted(&argv, session.ui) {
        Ok(0) => {
            if session.ui.text_visible() {
                session.say("\nInstall from sdcard complete.\n");
            }
        }
        result => {
            log::warn!("{INSTALL_PACKAGE} {file}: {result:?}");
            session.say("Installation aborted.\n");
        }
    }
}

/// Write a boot or recovery image straight to its partition.
fn install_image(session: &mut Session, what: &str, device: &str, file: &Path) {
    session.say(format!(
        "\n-- Install {} img from...\n{}\n",
        what.to_lowercase(),
        file.display()
    ));
    match session.flash.restore(device, file) {
        Ok(()) => session.say(format!("\n{what} flash from sdcard complete.\n")),
        Err(e) => {
            log::error!("flashing {} to {device}: {e:#}", file.display());
            session.say(format!("\n{what} flash failed ({e:#})\n"));
        }
    }
}

struct InstallMenu<'s, 'a> {
    session: &'s mut Session<'a>,
    sdcard: PathBuf,
    nandroid: NandroidPaths,
}

impl InstallMenu<'_, '_> {
    /// Pick a file under `base`; `None` if the operator backed out or there was nothing to pick.
    fn choose(&mut self, base: &Path, extensions: &[&str]) -> Option<PathBuf> {
        let base_str = base.to_string_lossy();
        if let Err(e) = self.session.volumes.ensure_mounted(&base_str) {
            self.session.say(format!("Cannot mount {base_str} ({e:#})\n"));
            return None;
        }

        let mut chosen = None;
        display_file_select_menu(self.session.ui, base, extensions, |file| {
            chosen = Some(file.to_path_buf())
        });
        chosen
    }
}

impl MenuHandler for InstallMenu<'_, '_> {
    fn on_select(&mut self, choice: Choice) -> Choice {
        let (base, extensions) = match choice {
            Choice::Item(ITEM_TAR) => (self.sdcard.clone(), TAR_EXTS),
            Choice::Item(ITEM_ZIP) => (self.sdcard.clone(), ZIP_EXTS),
            Choice::Item(ITEM_KERNEL) => (self.sdcard.join("kernels"), KERNEL_EXTS),
            Choice::Item(ITEM_RECOVERY) => (self.sdcard.join("recovery"), RECOVERY_EXTS),
            _ => return choice,
        };
        let Some(file) = self.choose(&base, extensions) else {
            return choice;
        };

        match choice {
            Choice::Item(ITEM_TAR) => install_rom_from_tar(self.session, &self.nandroid, &file),
            Choice::Item(ITEM_ZIP) => install_update_zip(self.session, &file),
            Choice::Item(ITEM_KERNEL) => install_image(self.session, "Kernel", "boot", &file),
            _ => install_image(self.session, "Recovery", "recovery", &file),
        }
        choice
    }
}

pub fn show_install_menu(session: &mut Session) {
    show_install_menu_from(session, SDCARD);
}

/// The install menu over an SD card mounted at `sdcard`
pub fn show_install_menu_from<P: AsRef<Path>>(session: &mut Session, sdcard: P) {
    let sdcard = sdcard.as_ref();
    let ui = session.ui;
    let mut handler = InstallMenu {
        session,
        sdcard: sdcard.to_path_buf(),
        nandroid: NandroidPaths::under(sdcard),
    };
    Menu::new(&["Choose an install option or press", "POWER to exit", ""])
        .items(vec![
            MenuItem::new(ITEM_TAR, "Install ROM tar from SD card"),
            MenuItem::new(ITEM_ZIP, "Install update.zip from SD card"),
            MenuItem::new(ITEM_KERNEL, "Install kernel img from /sdcard/kernels"),
            MenuItem::new(ITEM_RECOVERY, "Install recovery img from /sdcard/recovery"),
        ])
        .handler(&mut handler)
        .display(ui);
}

#[cfg(test)]
use crate::testutil::{FakeRunner, TestRig};

#[cfg(test)]
use crate::ui::Selection;

#[cfg(test)]
use std::fs;

#[test]
fn test_rom_install_with_backup() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let rom = sdcard.path().join("cm7.rom.tar");
    fs::write(&rom, b"rom")?;
    fs::write(sdcard.path().join("update.zip"), b"zip")?;

    let mut rig = TestRig::new([Selection::Index(0), Selection::Index(0)]);
    rig.ui.hold(Key::KEY_SPACE.code());
    rig.runner = FakeRunner::with_status(|cmd| {
        if cmd.starts_with(NANDROID_MOBILE) {
            3
        } else {
            0
        }
    });
    show_install_menu_from(&mut rig.session(), sdcard.path());

    // Only the ROM matches
    assert_eq!(rig.ui.shown_items()[1], ["cm7.rom.tar"]);
    assert_eq!(
        rig.runner.commands.last().unwrap(),
        &format!("{NANDROID_MOBILE} --install-rom {} --progress", rom.display())
    );
    let backups: Vec<_> = fs::read_dir(sdcard.path().join("nandroid"))?.collect();
    assert_eq!(backups.len(), 1);

    let output = rig.ui.output();
    assert!(output.contains("Backing up before installing...\n"));
    assert!(output.contains("ERROR: install exited with status 3\n"));
    assert_eq!(rig.ui.progress_log().last().unwrap(), "reset");
    Ok(())
}

#[test]
fn test_update_zip_verified() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let zip = sdcard.path().join("update.zip");
    fs::write(&zip, b"zip")?;

    let mut rig = TestRig::new([Selection::Index(1), Selection::Index(0)]);
    rig.config.install_do_signature_verification = true;
    show_install_menu_from(&mut rig.session(), sdcard.path());

    assert_eq!(
        rig.runner.commands,
        [format!("{INSTALL_PACKAGE} --verify {}", zip.display())]
    );
    assert!(rig.ui.output().contains("\nInstall from sdcard complete.\n"));

    let mut rig = TestRig::new([Selection::Index(1), Selection::Index(0)]);
    rig.runner = FakeRunner::with_status(|_| 1);
    show_install_menu_from(&mut rig.session(), sdcard.path());
    assert_eq!(
        rig.runner.commands,
        [format!("{INSTALL_PACKAGE} {}", zip.display())]
    );
    assert!(rig.ui.output().contains("Installation aborted.\n"));
    Ok(())
}

#[test]
fn test_kernel_image() -> anyhow::Result<()> {
    let sdcard = tempfile::tempdir()?;
    let kernels = sdcard.path().join("kernels");
    fs::create_dir(&kernels)?;
    fs::write(kernels.join("cm7-boot.img"), b"kernel")?;
    fs::write(kernels.join("notes.txt"), b"")?;

    // The recovery directory doesn't exist, so its chooser closes at once
    let mut rig = TestRig::new([
        Selection::Index(2),
        Selection::Index(0),
        Selection::Index(3),
    ]);
    show_install_menu_from(&mut rig.session(), sdcard.path());

    assert_eq!(
        rig.flash.restores,
        [("boot".to_string(), kernels.join("cm7-boot.img"))]
    );
    let output = rig.ui.output();
    assert!(output.contains("\n-- Install kernel img from...\n"));
    assert!(output.contains("\nKernel flash from sdcard complete.\n"));
    assert!(!output.contains("Recovery flash"));
    Ok(())
}
