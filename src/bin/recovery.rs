//! The interactive recovery session, started by the recovery image's init.
//!
//! It brings up the essential mounts, reads the device description and stored settings, then
//! runs the main menu on the console until the operator chooses to reboot or power off. Settings
//! are saved on the way out, whatever the choice.
use anyhow::Context;
use nix::sys::reboot::{reboot, RebootMode};
use retry::{delay::Fixed, retry};

use std::fs::OpenOptions;
use std::io::Write;

use rz_recovery::{
    config::{RecoveryConfig, CONFIG_PATH},
    exec::ShellRunner,
    flash::MtdFlash,
    partition::{PartitionTable, PARTITIONS_PATH},
    screens::{prompt_and_wait, PowerAction},
    session::{setup_mounts, Session},
    ui::{
        console::{ConsoleSize, Ui},
        input::{spawn_evdev_readers, spawn_stdin_reader},
    },
    volume::{SystemVolumes, FSTAB_PATH},
};

const CONSOLE_PATH: &str = "/dev/tty0";

/// The console can take a moment to appear after the kernel hands over
fn open_console() -> Box<dyn Write + Send> {
    let console = retry(Fixed::from_millis(100).take(20), || {
        OpenOptions::new().write(true).open(CONSOLE_PATH)
    });
    match console {
        Ok(file) => Box::new(file),
        Err(e) => {
            log::warn!("cannot open {CONSOLE_PATH} ({}); drawing on stdout", e.error);
            Box::new(std::io::stdout())
        }
    }
}

fn run() -> anyhow::Result<PowerAction> {
    setup_mounts().context("setting up essential mounts")?;

    let partitions = PartitionTable::load(PARTITIONS_PATH);
    let mut volumes = SystemVolumes::load(FSTAB_PATH)?;
    let mut config = RecoveryConfig::load(&mut volumes, CONFIG_PATH);

    let ui = Ui::start(open_console(), config.palette, ConsoleSize::default());
    if spawn_evdev_readers(ui.key_sink()) == 0 {
        log::warn!("no input devices found; reading keys from stdin");
    }
    spawn_stdin_reader(ui.key_sink());

    let (mut runner, mut flash) = (ShellRunner, MtdFlash);
    let action = prompt_and_wait(&mut Session {
        ui: &ui,
        volumes: &mut volumes,
        runner: &mut runner,
        flash: &mut flash,
        config: &mut config,
        partitions: &partitions,
    });

    if let Err(e) = config.save(&mut volumes, CONFIG_PATH) {
        log::error!("saving settings: {e:#}");
    }
    Ok(action)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let action = match run() {
        Ok(action) => action,
        Err(e) => {
            log::error!("recovery failed: {e:#}");
            PowerAction::Reboot
        }
    };

    nix::unistd::sync();
    let mode = match action {
        // Whether the next boot lands in recovery is up to the bootloader's own flags
        PowerAction::Reboot | PowerAction::RebootRecovery => RebootMode::RB_AUTOBOOT,
        PowerAction::PowerOff => RebootMode::RB_POWER_OFF,
    };
    reboot(mode)?;
    Ok(())
}
