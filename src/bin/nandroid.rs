//! Nandroid backups from a shell: the same engine the recovery menus use, without the menus.
//!
//! Useful for scripting and for checking a device description on the bench.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};

use std::path::PathBuf;
use std::{env, thread, time::Duration};

use rz_recovery::{
    config::{RecoveryConfig, CONFIG_PATH},
    exec::ShellRunner,
    flash::MtdFlash,
    nandroid::{self, Bundle, Report},
    partition::{PartitionTable, PARTITIONS_PATH},
    session::Session,
    ui::line::LineDisplay,
    volume::{SystemVolumes, FSTAB_PATH},
};

#[derive(Subcommand, Debug)]
enum Command {
    /// Back up partitions into a directory
    Backup {
        /// Directory to write the backup into; existing files in it are removed
        dir: PathBuf,

        /// Name of a partition to back up (repeatable; default: every saveable partition)
        #[clap(long = "partition")]
        partitions: Vec<String>,
    },

    /// Restore partitions from a backup directory
    Restore {
        dir: PathBuf,

        /// Name of a partition to restore (repeatable; default: every restoreable partition)
        #[clap(long = "partition")]
        partitions: Vec<String>,

        /// Skip checking the backup against its MD5 manifest
        #[clap(long)]
        no_md5: bool,
    },

    /// List the backups found on the SD card
    Scan,
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Volume table to use
    #[clap(long, default_value = FSTAB_PATH)]
    fstab: PathBuf,

    /// Partition table to use (the built-in one if missing)
    #[clap(long, default_value = PARTITIONS_PATH)]
    partitions: PathBuf,

    /// Stored recovery settings
    #[clap(long, default_value = CONFIG_PATH)]
    config: String,

    #[clap(subcommand)]
    cmd: Command,
}

/// Partition names to ids; no names means "all"
fn resolve(table: &PartitionTable, names: &[String]) -> Result<Option<Vec<usize>>> {
    if names.is_empty() {
        return Ok(None);
    }
    names
        .iter()
        .map(|name| match table.by_name(name) {
            Some(part) => Ok(part.id),
            None => bail!("no partition named {name:?}"),
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn absolute(dir: PathBuf) -> Result<PathBuf> {
    Ok(if dir.is_absolute() {
        dir
    } else {
        env::current_dir()?.join(dir)
    })
}

fn finish(report: Report) -> Result<()> {
    if !report.succeeded() {
        bail!("{} partitions failed", report.failures());
    }
    Ok(())
}

fn print_bundles(table: &PartitionTable, bundles: &[Bundle]) {
    for bundle in bundles {
        let names: Vec<&str> = bundle
            .partitions
            .iter()
            .filter_map(|mark| table.get(mark.id))
            .map(|part| part.name.as_str())
            .collect();
        let md5 = if bundle.md5 { " (md5)" } else { "" };
        println!("{}: {}{md5}", bundle.dir.display(), names.join(", "));
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    let table = PartitionTable::load(&args.partitions);
    let mut volumes = SystemVolumes::load(&args.fstab)?;
    let mut config = RecoveryConfig::load(&mut volumes, &args.config);

    let ui = LineDisplay;
    let (mut runner, mut flash) = (ShellRunner, MtdFlash);
    let mut session = Session {
        ui: &ui,
        volumes: &mut volumes,
        runner: &mut runner,
        flash: &mut flash,
        config: &mut config,
        partitions: &table,
    };

    let (dir, ids) = match &args.cmd {
        Command::Scan => {
            print_bundles(&table, &nandroid::scan(session.volumes, &table));
            return Ok(());
        }
        Command::Backup { dir, partitions } | Command::Restore { dir, partitions, .. } => {
            (absolute(dir.clone())?, resolve(&table, partitions)?)
        }
    };

    howudoin::init(howudoin::consumers::TermLine::default());
    let result = match args.cmd {
        Command::Restore { no_md5, .. } => {
            if no_md5 {
                session.config.nandroid_do_md5_verification = false;
            }
            nandroid::restore(&mut session, &dir, ids.as_deref())
        }
        _ => nandroid::backup(&mut session, &dir, ids.as_deref()),
    };
    howudoin::disable();
    thread::sleep(Duration::from_millis(10)); // Give howudoin time to shut down

    finish(result?)
}
