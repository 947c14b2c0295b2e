//! Browse a directory tree for one file with a wanted extension.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::{Choice, ItemId, Menu, MenuHandler, MenuItem};
use crate::ui::Display;

/// Directory ids count up from here...
pub const DIR_ID_BASE: ItemId = 0;
/// ...and file ids from here, so an id alone says which kind of entry it is.
pub const FILE_ID_BASE: ItemId = 0x10000;

#[derive(Debug)]
struct Entry {
    name: String,
    path: PathBuf,
}

/// A file-selection session. Navigation never goes above `base_path`; backing out there ends the
/// session, as does choosing a file.
pub struct FileSelect<F: FnMut(&Path)> {
    extensions: Vec<String>,
    base_path: PathBuf,
    cur_path: PathBuf,
    dirs: Vec<Entry>,
    files: Vec<Entry>,
    on_file_chosen: F,
}

impl<F: FnMut(&Path)> FileSelect<F> {
    /// An empty extension list accepts every file.
    pub fn new<P: AsRef<Path>>(base_path: P, extensions: &[&str], on_file_chosen: F) -> Self {
        let base_path = base_path.as_ref().to_path_buf();
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            cur_path: base_path.clone(),
            base_path,
            dirs: Vec::new(),
            files: Vec::new(),
            on_file_chosen,
        }
    }

    pub fn cur_path(&self) -> &Path {
        &self.cur_path
    }

    fn wanted(&self, name: &str) -> bool {
        self.extensions.is_empty()
            || self
                .extensions
                .iter()
                .any(|ext| name.ends_with(ext.as_str()))
    }

    /// Re-read the current directory. Order within each kind is the directory's own order.
    fn list(&mut self) -> io::Result<()> {
        self.dirs.clear();
        self.files.clear();

        for entry in fs::read_dir(&self.cur_path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            // Follows symlinks; dangling ones are left out
            let Ok(meta) = fs::metadata(&path) else {
                continue;
            };
            if meta.is_dir() {
                self.dirs.push(Entry { name, path });
            } else if meta.is_file() && self.wanted(&name) {
                self.files.push(Entry { name, path });
            }
        }
        Ok(())
    }
}

impl<F: FnMut(&Path)> MenuHandler for FileSelect<F> {
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        if let Err(e) = self.list() {
            log::warn!("cannot list {}: {e}", self.cur_path.display());
            self.dirs.clear();
            self.files.clear();
            return Vec::new();
        }

        let dirs = self
            .dirs
            .iter()
            .zip(DIR_ID_BASE..)
            .map(|(d, id)| MenuItem::new(id, format!("{}/", d.name)));
        let files = self
            .files
            .iter()
            .zip(FILE_ID_BASE..)
            .map(|(f, id)| MenuItem::new(id, f.name.clone()));
        dirs.chain(files).collect()
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        match choice {
            Choice::Back => {
                if self.cur_path == self.base_path {
                    return Choice::Back;
                }
                if let Some(parent) = self.cur_path.parent() {
                    self.cur_path = parent.to_path_buf();
                }
                Choice::Continue
            }
            Choice::Item(id) if id >= FILE_ID_BASE => {
                match self.files.get((id - FILE_ID_BASE) as usize) {
                    Some(file) => {
                        (self.on_file_chosen)(&file.path);
                        Choice::Back
                    }
                    None => choice,
                }
            }
            Choice::Item(id) => match self.dirs.get((id - DIR_ID_BASE) as usize) {
                Some(dir) => {
                    self.cur_path = dir.path.clone();
                    Choice::Continue
                }
                None => choice,
            },
            Choice::Continue => choice,
        }
    }
}

/// Let the operator pick a file under `base_path`; `on_file_chosen` runs at most once. The
/// caller makes sure `base_path` is mounted.
pub fn display_file_select_menu<P, F>(
    ui: &dyn Display,
    base_path: P,
    extensions: &[&str],
    on_file_chosen: F,
) where
    P: AsRef<Path>,
    F: FnMut(&Path),
{
    let mut session = FileSelect::new(base_path, extensions, on_file_chosen);
    let headers = [
        format!("Choose a file from {}", session.base_path.display()),
        String::new(),
    ];
    Menu::new(&headers).dynamic().handler(&mut session).display(ui);
}

#[cfg(test)]
use crate::ui::Selection;

#[cfg(test)]
use crate::testutil::ScriptedDisplay;

#[test]
fn test_file_select_navigation() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let base = dir.path();
    fs::create_dir(base.join("roms"))?;
    fs::write(base.join("roms/cm.zip"), b"")?;
    fs::write(base.join("update.zip"), b"")?;
    fs::write(base.join("notes.txt"), b"")?;
    fs::write(base.join(".hidden.zip"), b"")?;

    // Into roms/, back out to the base, then pick update.zip
    let ui = ScriptedDisplay::new([Selection::Index(0), Selection::Back, Selection::Index(1)]);
    let mut chosen = Vec::new();
    display_file_select_menu(&ui, base, &[".zip"], |path| chosen.push(path.to_path_buf()));

    assert_eq!(chosen, [base.join("update.zip")]);
    assert_eq!(
        ui.shown_items(),
        [
            vec!["roms/".to_string(), "update.zip".to_string()],
            vec!["cm.zip".to_string()],
            vec!["roms/".to_string(), "update.zip".to_string()],
        ]
    );
    Ok(())
}

#[test]
fn test_file_select_back_at_base_ends() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("kernel"))?;

    let mut calls = 0;
    let mut session = FileSelect::new(dir.path(), &[], |_| calls += 1);
    assert_eq!(session.on_create_items().len(), 1);
    assert_eq!(session.on_select(Choice::Item(DIR_ID_BASE)), Choice::Continue);
    assert_eq!(session.cur_path(), dir.path().join("kernel"));
    assert_eq!(session.on_select(Choice::Back), Choice::Continue);
    assert_eq!(session.cur_path(), dir.path());
    assert_eq!(session.on_select(Choice::Back), Choice::Back);
    // Ids that match nothing pass through
    assert_eq!(
        session.on_select(Choice::Item(FILE_ID_BASE + 3)),
        Choice::Item(FILE_ID_BASE + 3)
    );
    drop(session);
    assert_eq!(calls, 0);
    Ok(())
}

#[test]
fn test_file_select_vanished_directory() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let ui = ScriptedDisplay::new([Selection::Index(0)]);
    let mut chosen = false;
    display_file_select_menu(&ui, dir.path().join("missing"), &[".img"], |_| chosen = true);

    assert!(ui.shown().is_empty());
    assert!(!chosen);
    Ok(())
}
