// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use slog::{error, info, o, Drain, Level, Logger};
use vdisk::registry::AttachmentRegistry;
use vdisk::sim::{Inventory, SimControlPlane};
use vdisk::topology::ScsiTopology;
use vdisk::validate::validate;
use vdisk::{
    ControlPlane, DetachOutcome, Detacher, DiskOutcome, ErrorKind, MachineRef,
    OperationWaiter, Reconciler, Target,
};
use vdisk_config_toml::Config;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Reconcile the SCSI disks of a virtual machine against a TOML disk list
struct Opt {
    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Check a disk list without touching any machine
    Validate {
        #[clap(action)]
        config: PathBuf,
    },

    /// Create and attach the disks in a disk list
    Attach {
        #[clap(action)]
        config: PathBuf,

        /// JSON inventory of the simulated control plane
        #[clap(short, long, action)]
        inventory: PathBuf,
    },

    /// Detach every disk previously attached to the target machine
    Detach {
        #[clap(action)]
        config: PathBuf,

        /// JSON inventory of the simulated control plane
        #[clap(short, long, action)]
        inventory: PathBuf,
    },

    /// Print a machine's SCSI controllers, disks and attachment registry
    Show {
        /// JSON inventory of the simulated control plane
        #[clap(short, long, action)]
        inventory: PathBuf,

        #[clap(action)]
        machine: String,
    },

    /// Write an example inventory to start from
    InitInventory {
        #[clap(action)]
        path: PathBuf,

        /// Overwrite an existing file
        #[clap(short, long, action)]
        force: bool,
    },
}

fn create_logger(opt: &Opt) -> Logger {
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = if atty::is(atty::Stream::Stderr) {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        slog_async::Async::new(slog::LevelFilter(drain, level).fuse())
            .build()
            .fuse()
    } else {
        let drain = slog_bunyan::with_name("vdisk-cli", std::io::stderr())
            .build()
            .fuse();
        slog_async::Async::new(slog::LevelFilter(drain, level).fuse())
            .build()
            .fuse()
    };

    Logger::root(drain, o!())
}

/// Maps a failure onto the process exit status.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err.downcast_ref::<vdisk_config_toml::ParseError>().is_some() {
        return 2;
    }
    match err.downcast_ref::<vdisk::Error>().map(vdisk::Error::kind) {
        Some(ErrorKind::Config) => 2,
        Some(ErrorKind::PathFormat) => 3,
        Some(ErrorKind::NotFound) => 4,
        Some(ErrorKind::Conflict) => 5,
        Some(ErrorKind::ResourceExhausted) => 6,
        Some(ErrorKind::ProviderFault) => 7,
        None => 1,
    }
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    vdisk_config_toml::parse(path)
        .with_context(|| format!("reading {}", path.display()))
}

fn load_inventory(path: &Path) -> anyhow::Result<Inventory> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    Inventory::from_json(&json)
        .with_context(|| format!("parsing {}", path.display()))
}

fn save_inventory(path: &Path, inventory: &Inventory) -> anyhow::Result<()> {
    std::fs::write(path, inventory.to_json()?)
        .with_context(|| format!("writing {}", path.display()))
}

fn target(config: &Config) -> Target {
    Target {
        machine: MachineRef::new(config.target.machine.clone()),
        datacenter: config.target.datacenter.clone(),
        datastore: config.target.datastore.clone(),
    }
}

fn waiter(config: &Config) -> OperationWaiter {
    OperationWaiter::new(
        config.operations.initial_interval(),
        config.operations.max_interval(),
    )
}

async fn attach(
    config: &Config,
    cp: &SimControlPlane,
    log: &Logger,
) -> anyhow::Result<()> {
    let target = target(config);
    let reconciler = Reconciler::new(cp, waiter(config), log.clone());
    let report = reconciler.reconcile(&target, &config.disks).await?;

    for disk in &report.disks {
        match &disk.result {
            Ok(DiskOutcome::Attached {
                path,
                controller,
                unit_number,
                created,
            }) => {
                let verb = if *created { "created" } else { "attached" };
                println!(
                    "disk {}: {verb} {path} at {controller}:{unit_number}",
                    disk.index
                );
            }
            Ok(DiskOutcome::AlreadyAttached { path }) => {
                println!("disk {}: {path} already attached", disk.index);
            }
            Err(e) => println!("disk {}: failed: {e}", disk.index),
        }
    }

    match report.disks.into_iter().find_map(|disk| disk.result.err()) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn detach(
    config: &Config,
    cp: &SimControlPlane,
    log: &Logger,
) -> anyhow::Result<()> {
    let target = target(config);
    let report = Detacher::new(cp, waiter(config), log.clone())
        .detach_all(&target.machine)
        .await?;

    for (path, outcome) in &report.disks {
        match outcome {
            DetachOutcome::Detached => println!("{path}: detached"),
            DetachOutcome::Missing => println!("{path}: not attached"),
            DetachOutcome::Failed(e) => println!("{path}: failed: {e}"),
        }
    }

    match report.disks.into_iter().find_map(|(_, outcome)| match outcome {
        DetachOutcome::Failed(e) => Some(e),
        _ => None,
    }) {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

async fn show(
    cp: &SimControlPlane,
    vm: &MachineRef,
    log: &Logger,
) -> anyhow::Result<()> {
    let devices = cp.devices(vm).await?;
    let topology = ScsiTopology::build(&devices, log);
    for entry in topology.controllers() {
        let controller = &entry.controller;
        println!(
            "{} (key {}, bus {}, {}/{} disks)",
            controller.label,
            controller.key,
            controller.bus_number,
            entry.children.len(),
            vdisk::topology::ScsiController::CAPACITY,
        );
        for disk in &entry.children {
            let unit = disk
                .unit_number
                .map_or_else(|| "-".to_owned(), |u| u.to_string());
            println!(
                "  unit {unit:>2}: {} ({} KB)",
                disk.backing, disk.capacity_kb
            );
        }
    }

    let registry = AttachmentRegistry::load(cp, vm, log).await?;
    println!("attached by vdisk-cli: {}", registry.len());
    for path in registry.paths() {
        println!("  {path}");
    }
    Ok(())
}

/// Runs a command against the simulated control plane stored at `path`,
/// saving the inventory afterwards even if the command failed part way.
async fn with_inventory<F, Fut>(
    path: &Path,
    machine: &str,
    log: &Logger,
    command: F,
) -> anyhow::Result<()>
where
    F: FnOnce(SimControlPlane) -> Fut,
    Fut: std::future::Future<Output = (SimControlPlane, anyhow::Result<()>)>,
{
    let inventory = load_inventory(path)?;
    if !inventory.machines.contains_key(machine) {
        info!(log, "machine not found, nothing to do"; "machine" => machine);
        return Ok(());
    }

    let cp = SimControlPlane::new(inventory, log.new(o!("component" => "sim")));
    let (cp, result) = command(cp).await;
    save_inventory(path, &cp.into_inventory())?;
    result
}

async fn run(opt: Opt, log: &Logger) -> anyhow::Result<()> {
    match opt.cmd {
        Command::Validate { config } => {
            let config = load_config(&config)?;
            let disks = validate(&config.disks)?;
            info!(log, "disk list is valid"; "disks" => disks.len());
        }
        Command::Attach { config, inventory } => {
            let config = &load_config(&config)?;
            with_inventory(
                &inventory,
                &config.target.machine,
                log,
                |cp| async move {
                    let result = attach(config, &cp, log).await;
                    (cp, result)
                },
            )
            .await?;
        }
        Command::Detach { config, inventory } => {
            let config = &load_config(&config)?;
            with_inventory(
                &inventory,
                &config.target.machine,
                log,
                |cp| async move {
                    let result = detach(config, &cp, log).await;
                    (cp, result)
                },
            )
            .await?;
        }
        Command::Show { inventory, machine } => {
            let inventory = load_inventory(&inventory)?;
            if !inventory.machines.contains_key(&machine) {
                info!(log, "machine not found"; "machine" => &machine);
                return Ok(());
            }
            let cp = SimControlPlane::new(inventory, log.clone());
            show(&cp, &MachineRef::new(machine), log).await?;
        }
        Command::InitInventory { path, force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists, use --force to replace it",
                    path.display()
                );
            }
            save_inventory(&path, &Inventory::example())?;
            info!(log, "wrote example inventory"; "path" => %path.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    match run(opt, &log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            error!(log, "{:#}", e; "exit_code" => code);
            ExitCode::from(code)
        }
    }
}
