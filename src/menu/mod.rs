//! The menu engine: a headers-plus-items menu driven through the display until its handler
//! says "back".
//!
//! A menu's items are either a static list or rebuilt by the handler before every redraw, so
//! screens whose contents change as the operator acts on them (mount state, checkboxes, the
//! current directory) just describe what they look like right now.

pub mod file_select;

use std::borrow::Cow;

use crate::ui::{prepend_title, Display, Selection};

pub type ItemId = u32;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MenuItem {
    pub id: ItemId,
    pub title: String,
    /// Checkbox state, for items that have one
    pub checked: Option<bool>,
}

impl MenuItem {
    pub fn new(id: ItemId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            checked: None,
        }
    }

    pub fn checkbox(id: ItemId, title: impl Into<String>, checked: bool) -> Self {
        Self {
            checked: Some(checked),
            ..Self::new(id, title)
        }
    }

    /// The title as drawn, with a `(*)`/`( )` box for checkbox items
    pub fn display_title(&self) -> String {
        match self.checked {
            Some(true) => format!("(*) {}", self.title),
            Some(false) => format!("( ) {}", self.title),
            None => self.title.clone(),
        }
    }
}

/// What the operator picked, and what a handler answers with
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Choice {
    Item(ItemId),
    /// Leave this menu
    Back,
    /// Nothing terminal happened; redraw
    Continue,
}

/// Per-screen behaviour plugged into a `Menu`.
pub trait MenuHandler {
    /// Runs once, before the first redraw.
    fn on_create(&mut self) {}

    /// The items to show now. Only consulted by dynamic menus; an empty list closes the menu.
    fn on_create_items(&mut self) -> Vec<MenuItem> {
        Vec::new()
    }

    /// React to a choice (including `Back`). Returning `Back` closes the menu.
    fn on_select(&mut self, choice: Choice) -> Choice;

    /// Runs once, after the menu closes.
    fn on_destroy(&mut self) {}
}

enum ItemSource {
    Static(Vec<MenuItem>),
    Dynamic,
}

pub struct Menu<'h> {
    headers: Vec<String>,
    source: ItemSource,
    handler: Option<&'h mut dyn MenuHandler>,
}

impl<'h> Menu<'h> {
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Self {
        Self {
            headers: headers.iter().map(|h| h.as_ref().to_string()).collect(),
            source: ItemSource::Static(Vec::new()),
            handler: None,
        }
    }

    pub fn items(mut self, items: Vec<MenuItem>) -> Self {
        self.source = ItemSource::Static(items);
        self
    }

    /// Ask the handler for fresh items before every redraw
    pub fn dynamic(mut self) -> Self {
        self.source = ItemSource::Dynamic;
        self
    }

    pub fn handler(mut self, handler: &'h mut dyn MenuHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Run the menu until its handler answers `Back`, it runs out of items, or (without a
    /// handler) after showing it once.
    pub fn display(self, ui: &dyn Display) {
        let Menu {
            headers,
            source,
            mut handler,
        } = self;

        if let Some(handler) = handler.as_deref_mut() {
            handler.on_create();
        }

        let headers = prepend_title(&headers);
        let mut last = 0;

        loop {
            let items: Cow<'_, [MenuItem]> = match &source {
                ItemSource::Static(items) => Cow::Borrowed(items),
                ItemSource::Dynamic => Cow::Owned(
                    handler
                        .as_deref_mut()
                        .map(|h| h.on_create_items())
                        .unwrap_or_default(),
                ),
            };
            if items.is_empty() {
                break;
            }

            let titles: Vec<String> = items.iter().map(MenuItem::display_title).collect();
            let choice = match ui.select(&headers, &titles, last.min(items.len() - 1)) {
                Selection::Index(index) if index < items.len() => {
                    last = index;
                    Choice::Item(items[index].id)
                }
                _ => Choice::Back,
            };
            drop(titles);
            drop(items);

            let Some(handler) = handler.as_deref_mut() else {
                break;
            };
            if handler.on_select(choice) == Choice::Back {
                break;
            }
        }

        if let Some(handler) = handler {
            handler.on_destroy();
        }
    }
}

#[cfg(test)]
use crate::testutil::ScriptedDisplay;

#[cfg(test)]
#[derive(Default)]
struct Recorder {
    created: usize,
    destroyed: usize,
    selected: Vec<Choice>,
    pages: Vec<Vec<MenuItem>>,
}

#[cfg(test)]
impl MenuHandler for Recorder {
    fn on_create(&mut self) {
        self.created += 1;
    }

    fn on_create_items(&mut self) -> Vec<MenuItem> {
        if self.pages.is_empty() {
            Vec::new()
        } else {
            self.pages.remove(0)
        }
    }

    fn on_select(&mut self, choice: Choice) -> Choice {
        self.selected.push(choice);
        choice
    }

    fn on_destroy(&mut self) {
        self.destroyed += 1;
    }
}

#[test]
fn test_empty_dynamic_menu() {
    let ui = ScriptedDisplay::new([Selection::Index(0)]);
    let mut recorder = Recorder::default();
    Menu::new(&["Nothing here"])
        .dynamic()
        .handler(&mut recorder)
        .display(&ui);

    assert!(ui.shown().is_empty());
    assert!(recorder.selected.is_empty());
    assert_eq!((recorder.created, recorder.destroyed), (1, 1));
}

#[test]
fn test_static_menu_without_handler() {
    let ui = ScriptedDisplay::new([Selection::Index(1)]);
    Menu::new(&["Pick"])
        .items(vec![MenuItem::new(10, "a"), MenuItem::new(20, "b")])
        .display(&ui);

    let shown = ui.shown();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].0, prepend_title(&["Pick"]));
    assert_eq!(shown[0].1, ["a", "b"]);
}

#[test]
fn test_dynamic_menu_regenerates_and_clamps() {
    let ui = ScriptedDisplay::new([Selection::Index(2), Selection::Index(0), Selection::Back]);
    let mut recorder = Recorder {
        pages: vec![
            vec![
                MenuItem::new(1, "one"),
                MenuItem::new(2, "two"),
                MenuItem::checkbox(3, "three", true),
            ],
            vec![MenuItem::new(4, "four")],
            vec![MenuItem::checkbox(5, "five", false)],
        ],
        ..Default::default()
    };
    Menu::new(&["Pick"])
        .dynamic()
        .handler(&mut recorder)
        .display(&ui);

    assert_eq!(
        recorder.selected,
        [Choice::Item(3), Choice::Item(4), Choice::Back]
    );
    let shown = ui.shown();
    assert_eq!(shown[0].1, ["one", "two", "(*) three"]);
    // The previous choice seeds the next redraw, clamped to the new item count
    assert_eq!(shown[1].2, 0);
    assert_eq!(shown[2].1, ["( ) five"]);
    assert_eq!(recorder.destroyed, 1);
}

#[test]
fn test_out_of_range_selection_is_back() {
    let ui = ScriptedDisplay::new([Selection::Index(5)]);
    let mut recorder = Recorder::default();
    Menu::new(&["Pick"])
        .items(vec![MenuItem::new(1, "only")])
        .handler(&mut recorder)
        .display(&ui);

    assert_eq!(recorder.selected, [Choice::Back]);
}
