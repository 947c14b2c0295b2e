use crate::menu::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::nandroid::BackupType;
use crate::session::Session;

const ITEM_MD5: ItemId = 1;
const ITEM_SIGNATURES: ItemId = 2;
const ITEM_BACKUP_TYPE: ItemId = 3;

struct OptionsMenu<'s, 'a> {
    session: &'s mut Session<'a>,
}

impl MenuHandler for OptionsMenu<'_, '_> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        let config = &*self.session.config;
        vec![
            MenuItem::checkbox(
                ITEM_MD5,
                "Verify Nandroid MD5 Checksums",
                config.nandroid_do_md5_verification,
            ),
            MenuItem::checkbox(
                ITEM_SIGNATURES,
                "Verify Update.zip Signatures",
                config.install_do_signature_verification,
            ),
            MenuItem::new(
                ITEM_BACKUP_TYPE,
                format!(
                    "Nandroid backup type: {}",
                    BackupType::configured(config).label()
                ),
            ),
        ]
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        let config = &mut *self.session.config;
        match choice {
            Choice::Item(ITEM_MD5) => {
                config.nandroid_do_md5_verification = !config.nandroid_do_md5_verification;
            }
            Choice::Item(ITEM_SIGNATURES) => {
                config.install_do_signature_verification =
                    !config.install_do_signature_verification;
            }
            Choice::Item(ITEM_BACKUP_TYPE) => {
                let next = BackupType::configured(config).next_non_raw();
                config.nandroid_type = next.index();
            }
            _ => (),
        }
        choice
    }
}

/// Settings take effect at once; they are saved when the session ends.
pub fn show_options_menu(session: &mut Session) {
    let ui = session.ui;
    let mut handler = OptionsMenu { session };
    Menu::new(&["Select an option to change its value", ""])
        .dynamic()
        .handler(&mut handler)
        .display(ui);
}

#[cfg(test)]
use crate::testutil::TestRig;

#[cfg(test)]
use crate::ui::Selection;

#[test]
fn test_options_menu() {
    let mut rig = TestRig::new([
        Selection::Index(0),
        Selection::Index(1),
        Selection::Index(2),
        Selection::Index(2),
    ]);
    show_options_menu(&mut rig.session());

    let pages = rig.ui.shown_items();
    assert_eq!(
        pages[0],
        [
            "(*) Verify Nandroid MD5 Checksums",
            "( ) Verify Update.zip Signatures",
            "Nandroid backup type: tar"
        ]
    );
    assert_eq!(pages[1][0], "( ) Verify Nandroid MD5 Checksums");
    assert_eq!(pages[2][1], "(*) Verify Update.zip Signatures");
    assert_eq!(pages[3][2], "Nandroid backup type: tar.gz");
    assert_eq!(pages[4][2], "Nandroid backup type: tar.bz2");

    assert!(!rig.config.nandroid_do_md5_verification);
    assert!(rig.config.install_do_signature_verification);
    assert_eq!(rig.config.nandroid_type, BackupType::TarBz2.index());
}
