//! drover - parallel remote-command orchestration.
//!
//! Resolves the Supfile, the selected network and the requested commands
//! or targets, then hands everything to the drover-core engine.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use clap::Parser;
use drover_core::{run, sshconfig, Command, EnvList, RunError, RunOptions, Supfile};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "drover")]
#[command(version, about = "Run shell commands across many hosts in parallel")]
struct Cli {
    /// Path to the Supfile (default ./Supfile, then ./Supfile.yml)
    #[arg(short = 'f', long = "file")]
    file: Option<String>,

    /// Run only on hosts matching this regex
    #[arg(long)]
    only: Option<String>,

    /// Skip hosts matching this regex
    #[arg(long)]
    except: Option<String>,

    /// Read an ssh_config file and rewrite matching hosts
    #[arg(long, value_name = "PATH")]
    sshconfig: Option<String>,

    /// Set an environment variable for the run (repeatable)
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// Do not prefix output lines with the host label
    #[arg(long)]
    disable_prefix: bool,

    /// Enable verbose diagnostics
    #[arg(long)]
    debug: bool,

    /// Network to run on
    network: Option<String>,

    /// Command or target names, dispatched in order
    commands: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Err(err) = try_main(cli).await {
        let code = err
            .downcast_ref::<RunError>()
            .map_or(1, RunError::exit_code);
        eprintln!("{err:#}");
        std::process::exit(code);
    }
}

async fn try_main(cli: Cli) -> Result<()> {
    let conf = load_supfile(cli.file.as_deref())?;

    let Some(network_name) = &cli.network else {
        print_networks(&conf);
        bail!("Usage: drover [OPTIONS] NETWORK COMMAND [COMMAND ...]");
    };
    let Some(network) = conf.networks.get(network_name) else {
        print_networks(&conf);
        bail!("unknown network: {network_name}");
    };
    let mut network = network.clone();

    let inventory_hosts = network
        .parse_inventory()
        .with_context(|| format!("inventory of network {network_name} failed"))?;
    network.hosts.extend(inventory_hosts);

    if let Some(pattern) = &cli.only {
        let re = Regex::new(pattern)
            .with_context(|| format!("invalid --only regex '{pattern}'"))?;
        network.hosts.retain(|host| re.is_match(host));
        if network.hosts.is_empty() {
            bail!("no hosts match --only '{pattern}'");
        }
    }

    if let Some(pattern) = &cli.except {
        let re = Regex::new(pattern)
            .with_context(|| format!("invalid --except regex '{pattern}'"))?;
        network.hosts.retain(|host| !re.is_match(host));
        if network.hosts.is_empty() {
            bail!("no hosts left after --except '{pattern}'");
        }
    }

    if let Some(path) = &cli.sshconfig {
        let entries = sshconfig::parse_file(&resolve_path(path))?;
        sshconfig::apply_to_network(&entries, &mut network);
    }

    if network.hosts.is_empty() {
        print_networks(&conf);
        bail!("no hosts defined for network {network_name}");
    }

    if cli.commands.is_empty() {
        print_commands(&conf);
        bail!("Usage: drover [OPTIONS] NETWORK COMMAND [COMMAND ...]");
    }
    let commands = resolve_commands(&conf, &cli.commands)?;
    debug!(
        network = %network_name,
        hosts = network.hosts.len(),
        commands = commands.len(),
        "dispatching run"
    );

    // Later sources override earlier ones: Supfile env, then network
    // env, then defaults, then -e flags.
    let mut vars = EnvList::new();
    vars.merge(&conf.env);
    vars.merge(&network.env);
    seed_default_env(&mut vars, network_name);
    vars.set_assignments(&cli.env)?;

    let options = RunOptions {
        prefix: !cli.disable_prefix,
    };
    run(&network, &vars, &commands, &options).await?;
    Ok(())
}

fn load_supfile(flag: Option<&str>) -> Result<Supfile> {
    match flag {
        Some(path) => Ok(Supfile::load(&resolve_path(path))?),
        None => match Supfile::load(Path::new("./Supfile")) {
            Ok(conf) => Ok(conf),
            Err(first_err) => Supfile::load(Path::new("./Supfile.yml"))
                .with_context(|| first_err.to_string()),
        },
    }
}

/// Dispatch each name as a target first, then as a command.
fn resolve_commands(conf: &Supfile, names: &[String]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    for name in names {
        if let Some(target) = conf.targets.get(name) {
            for command_name in target {
                let Some(command) = conf.commands.get(command_name) else {
                    print_commands(conf);
                    bail!("unknown command: {command_name} (from target {name})");
                };
                commands.push(named(command, command_name));
            }
        } else if let Some(command) = conf.commands.get(name) {
            commands.push(named(command, name));
        } else {
            print_commands(conf);
            bail!("unknown command or target: {name}");
        }
    }
    Ok(commands)
}

fn named(command: &Command, name: &str) -> Command {
    let mut command = command.clone();
    command.name = name.to_string();
    command
}

fn seed_default_env(vars: &mut EnvList, network_name: &str) {
    vars.set("DROVER_NETWORK", network_name);

    // The run timestamp can be pinned from the caller's environment.
    let time = std::env::var("DROVER_TIME").unwrap_or_else(|_| {
        chrono::Utc::now()
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    });
    vars.set("DROVER_TIME", &time);

    if let Ok(user) = std::env::var("DROVER_USER").or_else(|_| std::env::var("USER")) {
        vars.set("DROVER_USER", &user);
    }
}

fn resolve_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn print_networks(conf: &Supfile) {
    eprintln!("Networks:");
    for name in conf.networks.names() {
        eprintln!("- {name}");
        if let Some(network) = conf.networks.get(name) {
            for host in &network.hosts {
                eprintln!("  - {host}");
            }
        }
    }
}

fn print_commands(conf: &Supfile) {
    eprintln!("Commands:");
    for name in conf.commands.names() {
        let desc = conf
            .commands
            .get(name)
            .and_then(|c| c.desc.clone())
            .unwrap_or_default();
        eprintln!("- {name:<24}{desc}");
    }
    if !conf.targets.is_empty() {
        eprintln!("Targets:");
        for name in conf.targets.names() {
            let list = conf
                .targets
                .get(name)
                .map(|t| t.join(" "))
                .unwrap_or_default();
            eprintln!("- {name:<24}{list}");
        }
    }
}
