//! The display and input service the menus are drawn through.
//!
//! `console::Ui` is the real thing: a text console with a scrollable menu, a log and a progress
//! bar, fed by keypad, trackball and keyboard threads. `LineDisplay` is a non-interactive stand-in
//! for command line tools.

pub mod console;
pub mod input;
pub mod line;

use evdev::Key;

/// Banner lines shown above every menu
pub const TITLE: [&str; 2] = ["RZ recovery", ""];

/// Outcome of asking the operator to pick from a menu
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Selection {
    Index(usize),
    Back,
}

pub trait Display {
    /// Show `headers` above a menu of `items`, starting at `initial`, and block until the
    /// operator picks one or backs out.
    fn select(&self, headers: &[String], items: &[String], initial: usize) -> Selection;

    /// Append text to the on-screen log.
    fn print(&self, text: &str);

    /// Start a new progress scope covering `portion` of the bar, optionally advancing on its own
    /// over `seconds`.
    fn show_progress(&self, portion: f32, seconds: u32);

    /// Set the progress within the current scope (0.0 to 1.0).
    fn set_progress(&self, fraction: f32);

    fn show_indeterminate_progress(&self);

    fn reset_progress(&self);

    fn text_visible(&self) -> bool;

    /// Is the key with this evdev code held down right now?
    fn key_pressed(&self, code: u16) -> bool;
}

/// What a key does while a menu is up
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum KeyAction {
    Up,
    Down,
    Select,
    Back,
    Nothing,
}

/// Trackball click on some devices
const KEY_CENTER: u16 = 232;

/// Map a key press to a menu action. Keys do nothing while the text display is hidden.
pub fn handle_key(code: u16, text_visible: bool) -> KeyAction {
    if !text_visible {
        return KeyAction::Nothing;
    }

    match Key::new(code) {
        Key::KEY_DOWN | Key::KEY_VOLUMEDOWN => KeyAction::Down,
        Key::KEY_UP | Key::KEY_VOLUMEUP => KeyAction::Up,
        Key::KEY_ENTER | Key::BTN_LEFT | Key::KEY_CAMERA => KeyAction::Select,
        Key::KEY_BACKSPACE | Key::KEY_BACK | Key::KEY_END | Key::KEY_POWER => KeyAction::Back,
        _ if code == KEY_CENTER => KeyAction::Select,
        _ => KeyAction::Nothing,
    }
}

/// `TITLE` followed by `headers`
pub fn prepend_title<S: AsRef<str>>(headers: &[S]) -> Vec<String> {
    TITLE
        .iter()
        .copied()
        .chain(headers.iter().map(AsRef::as_ref))
        .map(String::from)
        .collect()
}

#[test]
fn test_handle_key() {
    let code = |key: Key| key.code();

    assert_eq!(handle_key(code(Key::KEY_VOLUMEDOWN), true), KeyAction::Down);
    assert_eq!(handle_key(code(Key::KEY_UP), true), KeyAction::Up);
    assert_eq!(handle_key(code(Key::BTN_LEFT), true), KeyAction::Select);
    assert_eq!(handle_key(KEY_CENTER, true), KeyAction::Select);
    assert_eq!(handle_key(code(Key::KEY_POWER), true), KeyAction::Back);
    assert_eq!(handle_key(code(Key::KEY_A), true), KeyAction::Nothing);
    assert_eq!(handle_key(code(Key::KEY_DOWN), false), KeyAction::Nothing);
}

#[test]
fn test_prepend_title() {
    let headers = prepend_title(&["Choose an item to wipe", ""]);
    assert_eq!(headers.len(), TITLE.len() + 2);
    assert_eq!(headers[0], TITLE[0]);
    assert_eq!(headers[TITLE.len()], "Choose an item to wipe");
}
