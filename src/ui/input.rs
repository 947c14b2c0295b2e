//! Input plumbing: evdev and serial-console readers feeding a bounded key queue.

use evdev::{InputEventKind, Key, RelativeAxisType};

use std::collections::{HashSet, VecDeque};
use std::io::{self, BufRead};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;

/// Presses beyond this many unread ones are dropped
pub const KEY_QUEUE_MAX: usize = 256;

/// How far the trackball must roll before it counts as a key press
const TRACKBALL_THRESHOLD: i32 = 3;

/// Something that wants key events; implemented by the console display.
pub trait KeySink: Send + Sync {
    /// `value` is 1 for press, 0 for release, 2 for autorepeat. Synthetic events (trackball
    /// motion, serial console) have no matching release.
    fn key_event(&self, code: u16, value: i32, synthetic: bool);
}

#[derive(Debug, Default)]
struct KeyState {
    queue: VecDeque<u16>,
    held: HashSet<u16>,
}

/// Key presses waiting to be read, plus which keys are currently held down
#[derive(Debug, Default)]
pub struct KeyQueue {
    state: Mutex<KeyState>,
    cond: Condvar,
}

impl KeyQueue {
    fn lock(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record an event, returning whether it was a press that got queued.
    pub fn push(&self, code: u16, value: i32, synthetic: bool) -> bool {
        let mut state = self.lock();
        if !synthetic {
            if value != 0 {
                state.held.insert(code);
            } else {
                state.held.remove(&code);
            }
        }

        if value > 0 && state.queue.len() < KEY_QUEUE_MAX {
            state.queue.push_back(code);
            self.cond.notify_one();
            true
        } else {
            false
        }
    }

    /// Block until a key is pressed
    pub fn wait_key(&self) -> u16 {
        let mut state = self.lock();
        loop {
            if let Some(code) = state.queue.pop_front() {
                return code;
            }
            state = self.cond.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn clear(&self) {
        self.lock().queue.clear();
    }

    pub fn is_held(&self, code: u16) -> bool {
        self.lock().held.contains(&code)
    }
}

/// Turns raw evdev events into key events, folding trackball motion into up/down presses.
#[derive(Debug, Default)]
pub struct EventTranslator {
    rel_sum: i32,
}

impl EventTranslator {
    /// Returns `(code, value, synthetic)` for events that should reach the key queue
    pub fn translate(&mut self, kind: InputEventKind, value: i32) -> Option<(u16, i32, bool)> {
        match kind {
            InputEventKind::Synchronization(_) => None,
            InputEventKind::RelAxis(RelativeAxisType::REL_Y) => {
                self.rel_sum += value;
                let key = if self.rel_sum > TRACKBALL_THRESHOLD {
                    Key::KEY_DOWN
                } else if self.rel_sum < -TRACKBALL_THRESHOLD {
                    Key::KEY_UP
                } else {
                    return None;
                };
                self.rel_sum = 0;
                Some((key.code(), 1, true))
            }
            InputEventKind::RelAxis(_) => None,
            InputEventKind::Key(key) => {
                self.rel_sum = 0;
                Some((key.code(), value, false))
            }
            _ => {
                self.rel_sum = 0;
                None
            }
        }
    }
}

/// Open every input device and start a reader thread for each. Returns how many were opened.
pub fn spawn_evdev_readers(sink: Weak<dyn KeySink>) -> usize {
    let mut count = 0;
    for (path, mut device) in evdev::enumerate() {
        log::debug!(
            "reading input from {} ({})",
            path.display(),
            device.name().unwrap_or("unnamed")
        );

        let sink = sink.clone();
        thread::spawn(move || {
            let mut translator = EventTranslator::default();
            loop {
                let events: Vec<_> = match device.fetch_events() {
                    Ok(events) => events.collect(),
                    Err(e) => {
                        log::warn!("input device {} failed: {e}", path.display());
                        return;
                    }
                };

                let Some(sink) = sink.upgrade() else { return };
                for event in events {
                    if let Some((code, value, synthetic)) =
                        translator.translate(event.kind(), event.value())
                    {
                        sink.key_event(code, value, synthetic);
                    }
                }
            }
        });
        count += 1;
    }
    count
}

/// Keys typed on a line-buffered serial console. An empty line selects; otherwise each
/// character (or arrow-key escape) is one press.
pub fn keys_for_line(line: &str) -> Vec<Key> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return vec![Key::KEY_ENTER];
    }

    let mut keys = Vec::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let key = match c {
            '\x1b' => match (chars.next(), chars.next()) {
                (Some('['), Some('A')) => Key::KEY_UP,
                (Some('['), Some('B')) => Key::KEY_DOWN,
                (Some('['), Some('C')) => Key::KEY_ENTER,
                (Some('['), Some('D')) => Key::KEY_BACKSPACE,
                _ => continue,
            },
            'k' | 'w' => Key::KEY_UP,
            'j' | 's' => Key::KEY_DOWN,
            'q' | '\x7f' | '\x08' => Key::KEY_BACKSPACE,
            't' => Key::KEY_HOME,
            ' ' => Key::KEY_SPACE,
            _ => continue,
        };
        keys.push(key);
    }
    keys
}

/// Read keys from stdin, for consoles without a keypad
pub fn spawn_stdin_reader(sink: Weak<dyn KeySink>) {
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { return };
            let Some(sink) = sink.upgrade() else { return };
            for key in keys_for_line(&line) {
                sink.key_event(key.code(), 1, true);
            }
        }
    });
}

#[test]
fn test_key_queue() {
    let queue = KeyQueue::default();
    let space = Key::KEY_SPACE.code();

    assert!(queue.push(space, 1, false));
    assert!(queue.is_held(space));
    assert!(!queue.push(space, 0, false));
    assert!(!queue.is_held(space));

    // Synthetic presses are queued but never held
    assert!(queue.push(Key::KEY_DOWN.code(), 1, true));
    assert!(!queue.is_held(Key::KEY_DOWN.code()));

    assert_eq!(queue.wait_key(), space);
    assert_eq!(queue.wait_key(), Key::KEY_DOWN.code());

    for _ in 0..KEY_QUEUE_MAX {
        assert!(queue.push(space, 1, true));
    }
    assert!(!queue.push(space, 1, true));
    queue.clear();
    assert!(queue.push(Key::KEY_ENTER.code(), 1, true));
    assert_eq!(queue.wait_key(), Key::KEY_ENTER.code());
}

#[test]
fn test_wait_key_blocks_until_push() {
    use std::sync::Arc;

    let queue = Arc::new(KeyQueue::default());
    let waiter = {
        let queue = queue.clone();
        thread::spawn(move || queue.wait_key())
    };
    queue.push(Key::KEY_UP.code(), 1, false);
    assert_eq!(waiter.join().unwrap(), Key::KEY_UP.code());
}

#[test]
fn test_trackball_threshold() {
    let mut translator = EventTranslator::default();
    let rel_y = InputEventKind::RelAxis(RelativeAxisType::REL_Y);

    assert_eq!(translator.translate(rel_y, 2), None);
    assert_eq!(translator.translate(rel_y, 1), None);
    assert_eq!(
        translator.translate(rel_y, 1),
        Some((Key::KEY_DOWN.code(), 1, true))
    );

    assert_eq!(translator.translate(rel_y, -3), None);
    // A key event in between discards the accumulated motion
    assert_eq!(
        translator.translate(InputEventKind::Key(Key::KEY_ENTER), 1),
        Some((Key::KEY_ENTER.code(), 1, false))
    );
    assert_eq!(translator.translate(rel_y, -3), None);
    assert_eq!(
        translator.translate(rel_y, -1),
        Some((Key::KEY_UP.code(), 1, true))
    );
}

#[test]
fn test_keys_for_line() {
    assert_eq!(keys_for_line("\n"), [Key::KEY_ENTER]);
    assert_eq!(keys_for_line("jj"), [Key::KEY_DOWN, Key::KEY_DOWN]);
    assert_eq!(
        keys_for_line("\x1b[A\x1b[Dx"),
        [Key::KEY_UP, Key::KEY_BACKSPACE]
    );
    assert_eq!(keys_for_line("t"), [Key::KEY_HOME]);
}
