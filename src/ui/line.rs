//! A display for running the engine without a console: output goes to stderr, menus are
//! answered with "back".

use std::io::{self, Write};

use super::{Display, Selection};

#[derive(Debug, Default)]
pub struct LineDisplay;

impl Display for LineDisplay {
    fn select(&self, headers: &[String], _items: &[String], _initial: usize) -> Selection {
        log::warn!(
            "menu {:?} cannot be answered non-interactively",
            headers.iter().find(|h| !h.is_empty())
        );
        Selection::Back
    }

    fn print(&self, text: &str) {
        let mut stderr = io::stderr().lock();
        let _ = stderr.write_all(text.as_bytes());
        let _ = stderr.flush();
    }

    fn show_progress(&self, _portion: f32, _seconds: u32) {}

    fn set_progress(&self, _fraction: f32) {}

    fn show_indeterminate_progress(&self) {}

    fn reset_progress(&self) {}

    fn text_visible(&self) -> bool {
        true
    }

    fn key_pressed(&self, _code: u16) -> bool {
        false
    }
}
