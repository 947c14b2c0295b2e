//! The recovery-mode menu system and nandroid backup/restore engine.
//!
//! The binaries under `src/bin/` are thin: `recovery` runs the interactive menus on the console,
//! `nandroid` drives the same backup engine from a command line.

pub mod config;
pub mod exec;
pub mod flash;
pub mod menu;
pub mod nandroid;
pub mod partition;
pub mod screens;
pub mod session;
pub mod ui;
pub mod util;
pub mod volume;

#[cfg(test)]
mod testutil;
