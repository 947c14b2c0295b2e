//! The console display: menu, text log and progress bar drawn with ANSI escapes.
//!
//! All screen state lives behind one mutex. The menu loop, the progress animation thread and the
//! input threads (for the HOME text toggle) all redraw only while holding it.

use evdev::Key;

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::io::Write;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::input::{KeyQueue, KeySink};
use super::{handle_key, Display, KeyAction, Selection};
use crate::config::{Palette, Rgba};

const PROGRESS_FPS: u32 = 24;
const PROGRESS_WIDTH: usize = 40;
const INDETERMINATE_STATES: usize = 6;

/// Terminal geometry
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ConsoleSize {
    pub rows: usize,
    pub cols: usize,
}

impl Default for ConsoleSize {
    fn default() -> Self {
        Self { rows: 30, cols: 80 }
    }
}

/// Which part of a long menu is on screen, and what is highlighted
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MenuView {
    top: usize,
    items: usize,
    rows: usize,
    sel: usize,
    show_start: usize,
}

impl MenuView {
    /// `top` rows of headers above `items` entries, on a screen of `rows`
    pub fn new(top: usize, items: usize, rows: usize) -> Self {
        Self {
            top,
            items,
            rows,
            sel: 0,
            show_start: 0,
        }
    }

    fn item_rows(&self) -> usize {
        self.rows.saturating_sub(self.top).max(1)
    }

    /// Move the highlight to `sel`, wrapping past either end and scrolling to keep it visible.
    /// Returns the index actually selected.
    pub fn select(&mut self, sel: isize) -> usize {
        if self.items == 0 {
            return 0;
        }

        if sel < 0 {
            self.sel = self.items - 1;
            self.show_start = self.items.saturating_sub(self.item_rows());
        } else if sel as usize >= self.items {
            self.sel = 0;
            self.show_start = 0;
        } else {
            self.sel = sel as usize;
        }

        if self.sel < self.show_start && self.show_start > 0 {
            self.show_start -= 1;
        }
        if self.sel - self.show_start.min(self.sel) >= self.item_rows() {
            self.show_start += 1;
        }

        self.sel
    }

    pub fn selected(&self) -> usize {
        self.sel
    }

    /// Item indices currently on screen
    pub fn visible(&self) -> Range<usize> {
        self.show_start..self.items.min(self.show_start + self.item_rows())
    }
}

/// Apply one key action to a menu; `Some` once the operator has decided.
pub fn menu_step(view: &mut MenuView, action: KeyAction) -> Option<Selection> {
    let sel = view.selected() as isize;
    match action {
        KeyAction::Up => {
            view.select(sel - 1);
            None
        }
        KeyAction::Down => {
            view.select(sel + 1);
            None
        }
        KeyAction::Select => Some(Selection::Index(view.selected())),
        KeyAction::Back => Some(Selection::Back),
        KeyAction::Nothing => None,
    }
}

/// The scrolling log under the menu
#[derive(Debug)]
struct TextLog {
    lines: VecDeque<String>,
    current: String,
    cols: usize,
    rows: usize,
}

impl TextLog {
    fn new(size: ConsoleSize) -> Self {
        Self {
            lines: VecDeque::new(),
            current: String::new(),
            cols: size.cols.max(1),
            rows: size.rows.max(1),
        }
    }

    fn print(&mut self, text: &str) {
        for c in text.chars() {
            if c == '\n' || self.current.chars().count() >= self.cols {
                self.lines.push_back(std::mem::take(&mut self.current));
                while self.lines.len() >= self.rows {
                    self.lines.pop_front();
                }
            }
            if c != '\n' {
                self.current.push(c);
            }
        }
    }

    fn rows(&self) -> impl Iterator<Item = &str> {
        self.lines
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.current.as_str()))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ProgressKind {
    None,
    Indeterminate,
    Normal,
}

#[derive(Debug)]
struct Progress {
    kind: ProgressKind,
    scope_start: f32,
    scope_size: f32,
    scope_time: Instant,
    scope_duration: Duration,
    progress: f32,
    frame: usize,
}

impl Progress {
    fn new() -> Self {
        Self {
            kind: ProgressKind::None,
            scope_start: 0.0,
            scope_size: 0.0,
            scope_time: Instant::now(),
            scope_duration: Duration::ZERO,
            progress: 0.0,
            frame: 0,
        }
    }

    fn fraction(&self) -> f32 {
        (self.scope_start + self.progress * self.scope_size).clamp(0.0, 1.0)
    }

    fn bar(&self) -> Option<String> {
        let cells: String = match self.kind {
            ProgressKind::None => return None,
            ProgressKind::Indeterminate => (0..PROGRESS_WIDTH)
                .map(|i| {
                    if (i + self.frame) % INDETERMINATE_STATES == 0 {
                        '#'
                    } else {
                        '-'
                    }
                })
                .collect(),
            ProgressKind::Normal => {
                let filled = (self.fraction() * PROGRESS_WIDTH as f32) as usize;
                (0..PROGRESS_WIDTH)
                    .map(|i| if i < filled { '#' } else { '-' })
                    .collect()
            }
        };
        Some(format!("[{cells}]"))
    }
}

#[derive(Debug)]
struct MenuState {
    headers: Vec<String>,
    items: Vec<String>,
    view: MenuView,
}

/// Everything that is drawn; only touched with the update lock held
struct Screen {
    size: ConsoleSize,
    text: TextLog,
    show_text: bool,
    menu: Option<MenuState>,
    progress: Progress,
    palette: Palette,
    out: Box<dyn Write + Send>,
}

fn fg(c: Rgba) -> String {
    format!("\x1b[38;2;{};{};{}m", c.r, c.g, c.b)
}

fn bg(c: Rgba) -> String {
    format!("\x1b[48;2;{};{};{}m", c.r, c.g, c.b)
}

const RESET: &str = "\x1b[0m";

impl Screen {
    fn truncate<'a>(&self, line: &'a str) -> &'a str {
        match line.char_indices().nth(self.size.cols) {
            Some((end, _)) => &line[..end],
            None => line,
        }
    }

    fn render(&self) -> String {
        let palette = &self.palette;
        let mut frame = String::from("\x1b[H\x1b[2J");

        if self.show_text {
            if let Some(menu) = &self.menu {
                for header in &menu.headers {
                    let _ = writeln!(frame, "{}{}{RESET}", fg(palette.header_text), self.truncate(header));
                }
                for index in menu.view.visible() {
                    let title = self.truncate(&menu.items[index]);
                    if index == menu.view.selected() {
                        let _ = writeln!(
                            frame,
                            "{}{}{title}{RESET}",
                            bg(palette.menu),
                            fg(palette.menu_selected_text)
                        );
                    } else {
                        let _ = writeln!(frame, "{}{title}{RESET}", fg(palette.menu_text));
                    }
                }
                let _ = writeln!(frame, "{}{}{RESET}", fg(palette.menu), "-".repeat(self.size.cols));
            }

            for line in self.text.rows() {
                let _ = writeln!(frame, "{}{line}{RESET}", fg(palette.normal_text));
            }
        }

        if let Some(bar) = self.progress.bar() {
            let _ = writeln!(frame, "{}{bar}{RESET}", fg(palette.normal_text));
        }

        frame
    }

    /// Redraw the whole screen
    fn update(&mut self) {
        let frame = self.render();
        let result = self
            .out
            .write_all(frame.as_bytes())
            .and_then(|_| self.out.flush());
        if let Err(e) = result {
            log::debug!("console write failed: {e}");
        }
    }

    /// Advance the animation and the timed progress estimate; returns whether anything changed
    fn tick(&mut self, now: Instant) -> bool {
        let progress = &mut self.progress;
        match progress.kind {
            ProgressKind::Indeterminate => {
                progress.frame = progress.frame.wrapping_add(1);
                true
            }
            ProgressKind::Normal if !progress.scope_duration.is_zero() => {
                let elapsed = now.saturating_duration_since(progress.scope_time);
                let estimate =
                    (elapsed.as_secs_f32() / progress.scope_duration.as_secs_f32()).min(1.0);
                if estimate > progress.progress {
                    progress.progress = estimate;
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }
}

struct Shared {
    screen: Mutex<Screen>,
    keys: KeyQueue,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Screen> {
        self.screen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl KeySink for Shared {
    fn key_event(&self, code: u16, value: i32, synthetic: bool) {
        self.keys.push(code, value, synthetic);

        if value > 0 && code == Key::KEY_HOME.code() {
            let mut screen = self.lock();
            screen.show_text = !screen.show_text;
            screen.update();
        }
    }
}

/// Keeps the progress bar moving while the main thread is busy
fn progress_thread(shared: Weak<Shared>) {
    let interval = Duration::from_secs(1) / PROGRESS_FPS;
    loop {
        thread::sleep(interval);
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut screen = shared.lock();
        if screen.tick(Instant::now()) {
            screen.update();
        }
    }
}

/// The interactive console display
pub struct Ui {
    shared: Arc<Shared>,
}

impl Ui {
    /// Start drawing to `out`, with the text log visible.
    pub fn start(out: Box<dyn Write + Send>, palette: Palette, size: ConsoleSize) -> Self {
        let shared = Arc::new(Shared {
            screen: Mutex::new(Screen {
                size,
                text: TextLog::new(size),
                show_text: true,
                menu: None,
                progress: Progress::new(),
                palette,
                out,
            }),
            keys: KeyQueue::default(),
        });

        let weak = Arc::downgrade(&shared);
        thread::spawn(move || progress_thread(weak));

        shared.lock().update();
        Self { shared }
    }

    /// Where input readers should deliver key events
    pub fn key_sink(&self) -> Weak<dyn KeySink> {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        weak
    }

    fn lock(&self) -> MutexGuard<'_, Screen> {
        self.shared.lock()
    }

    fn start_menu(&self, headers: &[String], items: &[String], initial: usize) {
        let mut screen = self.lock();
        let mut view = MenuView::new(headers.len(), items.len(), screen.size.rows);
        for _ in 0..initial.min(items.len().saturating_sub(1)) {
            view.select(view.selected() as isize + 1);
        }
        screen.menu = Some(MenuState {
            headers: headers.to_vec(),
            items: items.to_vec(),
            view,
        });
        screen.update();
    }

    fn end_menu(&self) {
        let mut screen = self.lock();
        if screen.menu.take().is_some() {
            screen.update();
        }
    }
}

impl Display for Ui {
    fn select(&self, headers: &[String], items: &[String], initial: usize) -> Selection {
        if items.is_empty() {
            return Selection::Back;
        }

        self.shared.keys.clear();
        self.start_menu(headers, items, initial);

        let chosen = loop {
            let key = self.shared.keys.wait_key();
            let visible = self.text_visible();

            let mut screen = self.lock();
            let Some(menu) = screen.menu.as_mut() else {
                break Selection::Back;
            };
            let before = menu.view.clone();
            let decided = menu_step(&mut menu.view, handle_key(key, visible));
            if menu.view != before {
                screen.update();
            }
            if let Some(selection) = decided {
                break selection;
            }
        };

        self.end_menu();
        chosen
    }

    fn print(&self, text: &str) {
        log::debug!(target: "ui", "{}", text.trim_end());
        let mut screen = self.lock();
        screen.text.print(text);
        screen.update();
    }

    fn show_progress(&self, portion: f32, seconds: u32) {
        let mut screen = self.lock();
        let progress = &mut screen.progress;
        progress.kind = ProgressKind::Normal;
        progress.scope_start += progress.scope_size;
        progress.scope_size = portion;
        progress.scope_time = Instant::now();
        progress.scope_duration = Duration::from_secs(seconds.into());
        progress.progress = 0.0;
        screen.update();
    }

    fn set_progress(&self, fraction: f32) {
        let mut screen = self.lock();
        let fraction = fraction.clamp(0.0, 1.0);
        let progress = &mut screen.progress;
        if progress.kind != ProgressKind::Normal || fraction <= progress.progress {
            return;
        }

        // Skip updates that aren't visibly different
        let scale = PROGRESS_WIDTH as f32 * progress.scope_size;
        let changed = (progress.progress * scale) as usize != (fraction * scale) as usize;
        progress.progress = fraction;
        if changed {
            screen.update();
        }
    }

    fn show_indeterminate_progress(&self) {
        let mut screen = self.lock();
        if screen.progress.kind != ProgressKind::Indeterminate {
            screen.progress.kind = ProgressKind::Indeterminate;
            screen.update();
        }
    }

    fn reset_progress(&self) {
        let mut screen = self.lock();
        screen.progress = Progress::new();
        screen.update();
    }

    fn text_visible(&self) -> bool {
        self.lock().show_text
    }

    fn key_pressed(&self, code: u16) -> bool {
        self.shared.keys.is_held(code)
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_menu_view_wraps_and_scrolls() {
    // 2 header rows on a 6-row screen leaves 4 rows for 10 items
    let mut view = MenuView::new(2, 10, 6);
    assert_eq!(view.visible(), 0..4);

    assert_eq!(view.select(-1), 9);
    assert_eq!(view.visible(), 6..10);

    assert_eq!(view.select(10), 0);
    assert_eq!(view.visible(), 0..4);

    for sel in 1..=4 {
        view.select(sel);
    }
    assert_eq!(view.selected(), 4);
    assert_eq!(view.visible(), 1..5);

    for sel in (0..=3).rev() {
        view.select(sel);
    }
    assert_eq!(view.visible(), 0..4);
}

#[test]
fn test_menu_step() {
    let mut view = MenuView::new(0, 3, 10);
    assert_eq!(menu_step(&mut view, KeyAction::Up), None);
    assert_eq!(view.selected(), 2);
    assert_eq!(menu_step(&mut view, KeyAction::Down), None);
    assert_eq!(view.selected(), 0);
    assert_eq!(menu_step(&mut view, KeyAction::Nothing), None);
    assert_eq!(
        menu_step(&mut view, KeyAction::Select),
        Some(Selection::Index(0))
    );
    assert_eq!(menu_step(&mut view, KeyAction::Back), Some(Selection::Back));
}

#[test]
fn test_text_log_wraps() {
    let mut log = TextLog::new(ConsoleSize { rows: 3, cols: 4 });
    log.print("abcdef\nxy\nlast");
    assert_eq!(log.rows().collect::<Vec<_>>(), ["ef", "xy", "last"]);
}

#[test]
fn test_progress_tick() {
    let start = Instant::now();
    let mut screen = Screen {
        size: ConsoleSize::default(),
        text: TextLog::new(ConsoleSize::default()),
        show_text: false,
        menu: None,
        progress: Progress::new(),
        palette: Palette::default(),
        out: Box::new(std::io::sink()),
    };
    assert!(!screen.tick(start));

    screen.progress.kind = ProgressKind::Normal;
    screen.progress.scope_size = 1.0;
    screen.progress.scope_time = start;
    screen.progress.scope_duration = Duration::from_secs(10);
    assert!(screen.tick(start + Duration::from_secs(5)));
    assert!((screen.progress.fraction() - 0.5).abs() < 1e-6);
    assert!(!screen.tick(start + Duration::from_secs(4)));
    assert!(screen.tick(start + Duration::from_secs(60)));
    assert_eq!(screen.progress.fraction(), 1.0);
    assert_eq!(screen.progress.bar(), Some(format!("[{}]", "#".repeat(PROGRESS_WIDTH))));
}

#[test]
fn test_ui_select_and_print() {
    let buf = SharedBuf::default();
    let ui = Ui::start(Box::new(buf.clone()), Palette::default(), ConsoleSize::default());
    ui.print("hello from the log\n");

    let sink = ui.key_sink();
    let presser = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        let sink = sink.upgrade().unwrap();
        for key in [Key::KEY_DOWN, Key::KEY_DOWN, Key::KEY_ENTER] {
            sink.key_event(key.code(), 1, true);
        }
    });

    let headers = vec!["Pick one".to_string()];
    let items: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(ui.select(&headers, &items, 0), Selection::Index(2));
    presser.join().unwrap();

    let drawn = String::from_utf8_lossy(&buf.0.lock().unwrap()).into_owned();
    assert!(drawn.contains("hello from the log"));
    assert!(drawn.contains("Pick one"));
    assert!(ui.text_visible());
}
