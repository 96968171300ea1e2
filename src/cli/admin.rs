//! Remote-admin commands
//!
//! Thin wrappers over `talosctl`. Each entry in [`REGISTRY`] becomes a
//! subcommand taking `-f/--file` (node files whose modelines supply nodes and
//! endpoints) and passthrough arguments for talosctl.

use std::path::{Path, PathBuf};

use clap::{Arg, ArgAction, ArgMatches, Command};
use tokio::process::Command as Process;
use tracing::{debug, info};

use crate::modeline::{self, Targets};

use super::{CommandError, CommandResult, GlobalArgs};

/// One remote-admin subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCommand {
    pub name: &'static str,
    pub about: &'static str,
    /// talosctl subcommand words.
    pub talosctl: &'static [&'static str],
}

pub static REGISTRY: &[RemoteCommand] = &[
    RemoteCommand { name: "logs", about: "Show logs of a service", talosctl: &["logs"] },
    RemoteCommand { name: "services", about: "List services and their state", talosctl: &["services"] },
    RemoteCommand { name: "reboot", about: "Reboot nodes", talosctl: &["reboot"] },
    RemoteCommand { name: "shutdown", about: "Shut nodes down", talosctl: &["shutdown"] },
    RemoteCommand { name: "version", about: "Show Talos versions of nodes", talosctl: &["version"] },
    RemoteCommand { name: "health", about: "Check cluster health", talosctl: &["health"] },
    RemoteCommand { name: "dmesg", about: "Show kernel logs", talosctl: &["dmesg"] },
    RemoteCommand { name: "get", about: "Get resources from nodes", talosctl: &["get"] },
    RemoteCommand { name: "containers", about: "List containers", talosctl: &["containers"] },
    RemoteCommand { name: "memory", about: "Show memory usage", talosctl: &["memory"] },
    RemoteCommand { name: "disks", about: "List disks", talosctl: &["get", "disks"] },
    RemoteCommand { name: "upgrade", about: "Upgrade Talos on nodes", talosctl: &["upgrade"] },
    RemoteCommand { name: "reset", about: "Reset nodes", talosctl: &["reset"] },
    RemoteCommand { name: "bootstrap", about: "Bootstrap etcd on a control-plane node", talosctl: &["bootstrap"] },
    RemoteCommand { name: "kubeconfig", about: "Download the admin kubeconfig", talosctl: &["kubeconfig"] },
    RemoteCommand { name: "dashboard", about: "Open the node dashboard", talosctl: &["dashboard"] },
];

pub fn lookup(name: &str) -> Option<&'static RemoteCommand> {
    REGISTRY.iter().find(|c| c.name == name)
}

impl RemoteCommand {
    /// The clap subcommand for this entry.
    pub fn command(&self) -> Command {
        Command::new(self.name)
            .about(self.about)
            .arg(
                Arg::new("file")
                    .short('f')
                    .long("file")
                    .value_name("FILE")
                    .value_parser(clap::value_parser!(PathBuf))
                    .action(ArgAction::Append)
                    .help("Node file whose modeline supplies nodes and endpoints"),
            )
            .arg(
                Arg::new("args")
                    .value_name("ARGS")
                    .num_args(0..)
                    .trailing_var_arg(true)
                    .allow_hyphen_values(true)
                    .help("Arguments passed to talosctl"),
            )
    }
}

/// Add every registry entry to `cli`.
pub fn augment(cli: Command) -> Command {
    REGISTRY.iter().fold(cli, |cli, entry| cli.subcommand(entry.command()))
}

/// A parsed remote-admin invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteInvocation {
    pub command: &'static RemoteCommand,
    pub files: Vec<PathBuf>,
    pub args: Vec<String>,
}

impl RemoteInvocation {
    pub fn from_matches(command: &'static RemoteCommand, matches: &ArgMatches) -> Self {
        Self {
            command,
            files: matches
                .get_many::<PathBuf>("file")
                .map(|files| files.cloned().collect())
                .unwrap_or_default(),
            args: matches
                .get_many::<String>("args")
                .map(|args| args.cloned().collect())
                .unwrap_or_default(),
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// talosctl arguments for one call.
pub fn build_args(
    command: &RemoteCommand,
    targets: &Targets,
    talosconfig: &Path,
    passthrough: &[String],
) -> Vec<String> {
    let mut args = vec!["--talosconfig".to_string(), talosconfig.display().to_string()];
    if !targets.nodes.is_empty() {
        args.push("--nodes".to_string());
        args.push(targets.nodes.join(","));
    }
    if !targets.endpoints.is_empty() {
        args.push("--endpoints".to_string());
        args.push(targets.endpoints.join(","));
    }
    args.extend(command.talosctl.iter().map(|s| s.to_string()));
    args.extend(passthrough.iter().cloned());
    args
}

/// One target set per file, or the global one when no file is given.
pub fn plan(invocation: &RemoteInvocation, globals: &GlobalArgs) -> CommandResult<Vec<Targets>> {
    if invocation.files.is_empty() {
        return Ok(vec![Targets::resolve(&globals.nodes, &globals.endpoints, None)]);
    }
    invocation
        .files
        .iter()
        .map(|file| {
            let line = modeline::read_from_file(file)?;
            Ok(Targets::resolve(&globals.nodes, &globals.endpoints, Some(&line)))
        })
        .collect()
}

// ============================================================================
// I/O boundary
// ============================================================================

/// Run talosctl with `args`, inheriting stdio.
pub async fn talosctl(args: &[String]) -> CommandResult<()> {
    debug!(?args, "talosctl");
    let status = Process::new("talosctl")
        .args(args)
        .status()
        .await
        .map_err(|e| CommandError::Talosctl(format!("cannot run talosctl: {e}")))?;
    if status.success() {
        Ok(())
    } else {
        Err(CommandError::ChildExit(status.code().unwrap_or(1)))
    }
}

pub async fn run(invocation: &RemoteInvocation, globals: &GlobalArgs) -> CommandResult<()> {
    let talosconfig = globals.talosconfig_path();
    for targets in plan(invocation, globals)? {
        info!(command = invocation.command.name, nodes = ?targets.nodes, "remote command");
        let args = build_args(invocation.command, &targets, &talosconfig, &invocation.args);
        talosctl(&args).await?;
    }
    Ok(())
}
