//! Running external programs: archivers, checksum tools and install scripts.
//!
//! Everything goes through `CommandRunner` so the nandroid engine and the screens can be driven
//! against a recording fake.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Stdio};

use crate::ui::{Display, Selection};

/// Synchronous process execution, reporting the exit status
pub trait CommandRunner {
    /// Run `cmdline` through the shell and wait for it.
    fn run(&mut self, cmdline: &str) -> io::Result<i32>;

    /// Run a program that speaks the script protocol on its stdout (see `ScriptSession`), and
    /// wait for it.
    fn run_scripted(&mut self, argv: &[&str], ui: &dyn Display) -> io::Result<i32>;
}

/// Map an exit status to a single number: the exit code, or 128 + signal
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

/// `CommandRunner` using `/bin/sh`
#[derive(Debug, Default)]
pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&mut self, cmdline: &str) -> io::Result<i32> {
        log::debug!("sh -c {cmdline:?}");
        let status = Command::new("/bin/sh").arg("-c").arg(cmdline).status()?;
        let code = exit_code(status);
        if code != 0 {
            log::warn!("command exited with status {code}: {cmdline}");
        }
        Ok(code)
    }

    fn run_scripted(&mut self, argv: &[&str], ui: &dyn Display) -> io::Result<i32> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

        log::debug!("running script {program} {args:?}");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let from = child.stdout.take().map(BufReader::new);
        let to = child.stdin.take();
        let driven = match (from, to) {
            (Some(from), Some(mut to)) => ScriptSession::new(ui).drive(from, &mut to),
            _ => Ok(()),
        };

        let status = child.wait()?;
        driven?;
        ui.print("\n");
        Ok(exit_code(status))
    }
}

/// Interpreter for the line protocol install scripts use to drive the display.
///
/// Lines of the form `* <command> [argument]` are commands; everything else is passed through to
/// the log. Menu commands answer on the script's stdin, one line per answer.
pub struct ScriptSession<'u> {
    ui: &'u dyn Display,
    total_lines: u64,
    headers: Vec<String>,
    header_count: usize,
    items: Vec<String>,
    item_count: usize,
    checks: Vec<String>,
    check_count: usize,
    flags: u64,
}

impl<'u> ScriptSession<'u> {
    pub fn new(ui: &'u dyn Display) -> Self {
        Self {
            ui,
            total_lines: 0,
            headers: Vec::new(),
            header_count: 0,
            items: Vec::new(),
            item_count: 0,
            checks: Vec::new(),
            check_count: 0,
            flags: u64::MAX,
        }
    }

    /// Consume the script's output until EOF
    pub fn drive<R: BufRead, W: Write>(&mut self, from: R, to: &mut W) -> io::Result<()> {
        for line in from.lines() {
            let line = line?;
            log::debug!("script: {line}");
            self.handle(&line, to)?;
        }
        Ok(())
    }

    fn handle<W: Write>(&mut self, line: &str, to: &mut W) -> io::Result<()> {
        let mut tokens = line.trim_start().splitn(2, ' ');
        if tokens.next() != Some("*") {
            return Ok(());
        }
        let rest = tokens.next().unwrap_or("").trim_start();
        let (command, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        let count = || arg.trim().parse::<usize>().unwrap_or(0);

        match command {
            "" => (),
            "ptotal" => {
                self.ui.set_progress(0.0);
                self.ui.show_progress(1.0, 0);
                self.total_lines = arg.trim().parse().unwrap_or(0);
            }
            "pcur" => {
                let cur: u64 = arg.trim().parse().unwrap_or(0);
                let total = self.total_lines;
                if total > 0 {
                    if cur % 10 == 0 || total.saturating_sub(cur) < 10 {
                        self.ui.set_progress(cur as f32 / total as f32);
                    }
                    if cur == total {
                        self.ui.reset_progress();
                    }
                }
            }
            "print" => self.ui.print(&format!("{arg}\n")),
            "show_indeterminate_progress" => self.ui.show_indeterminate_progress(),
            "headers" => {
                self.header_count = count();
                self.headers.clear();
            }
            "header" => {
                if self.headers.len() < self.header_count {
                    self.headers.push(arg.to_string());
                }
            }
            "items" => {
                self.item_count = count();
                self.items.clear();
            }
            "item" => {
                if self.items.len() < self.item_count {
                    self.items.push(arg.to_string());
                }
            }
            "show_menu" => {
                let choice = match self.ui.select(&self.headers, &self.items, 0) {
                    Selection::Index(i) => i as i64,
                    Selection::Back => -1,
                };
                writeln!(to, "{choice}")?;
                to.flush()?;
            }
            "check_items" => {
                self.check_count = count().min(u64::BITS as usize);
                self.checks.clear();
            }
            "check_item" => {
                if self.checks.len() < self.check_count {
                    self.checks.push(arg.to_string());
                }
            }
            "show_check_menu" => {
                self.show_check_menu();
                for bit in 0..self.checks.len() {
                    writeln!(to, "{}", (self.flags >> bit) & 1)?;
                }
                to.flush()?;
            }
            _ => self.ui.print(&format!("unrecognized command {command}\n")),
        }

        Ok(())
    }

    /// A "Finished" entry followed by one checkbox per check item; loops until Finished or back.
    fn show_check_menu(&mut self) {
        let mut last = 0;
        loop {
            let mut items = vec!["Finished".to_string()];
            items.extend(self.checks.iter().enumerate().map(|(bit, title)| {
                let mark = if (self.flags >> bit) & 1 != 0 { '*' } else { ' ' };
                format!("({mark}) {title}")
            }));

            match self.ui.select(&self.headers, &items, last) {
                Selection::Index(0) | Selection::Back => break,
                Selection::Index(i) => {
                    self.flags ^= 1 << (i - 1);
                    last = i;
                }
            }
        }
    }
}

#[cfg(test)]
use crate::testutil::ScriptedDisplay;

#[test]
fn test_script_print_and_progress() -> io::Result<()> {
    let ui = ScriptedDisplay::new([]);
    let script = "\
plain output is ignored
* ptotal 20
* pcur 10
* print Installing ROM...
* pcur 20
* bogus
";
    let mut answers = Vec::new();
    ScriptSession::new(&ui).drive(script.as_bytes(), &mut answers)?;

    assert!(answers.is_empty());
    assert_eq!(
        ui.printed(),
        ["Installing ROM...\n", "unrecognized command bogus\n"]
    );
    assert_eq!(ui.progress_log(), ["set 0", "show 1 0", "set 0.5", "set 1", "reset"]);
    Ok(())
}

#[test]
fn test_script_menu_answers() -> io::Result<()> {
    let ui = ScriptedDisplay::new([Selection::Index(1)]);
    let script = "\
* headers 1
* header Pick a kernel
* items 3
* item stock
* item overclocked
* item undervolted
* item this one is past the count
* show_menu
";
    let mut answers = Vec::new();
    ScriptSession::new(&ui).drive(script.as_bytes(), &mut answers)?;

    assert_eq!(answers, b"1\n");
    let shown = ui.shown();
    assert_eq!(shown[0].0, ["Pick a kernel"]);
    assert_eq!(shown[0].1, ["stock", "overclocked", "undervolted"]);
    Ok(())
}

#[test]
fn test_script_check_menu() -> io::Result<()> {
    // Untick the second box, then finish
    let ui = ScriptedDisplay::new([Selection::Index(2), Selection::Index(0)]);
    let script = "\
* check_items 2
* check_item wipe data
* check_item wipe cache
* show_check_menu
";
    let mut answers = Vec::new();
    ScriptSession::new(&ui).drive(script.as_bytes(), &mut answers)?;

    assert_eq!(answers, b"1\n0\n");
    let shown = ui.shown();
    assert_eq!(shown[0].1, ["Finished", "(*) wipe data", "(*) wipe cache"]);
    assert_eq!(shown[1].1, ["Finished", "(*) wipe data", "( ) wipe cache"]);
    assert_eq!(shown[1].2, 2);
    Ok(())
}

#[test]
fn test_exit_code() {
    assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
    assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
    assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
}
