//! CLI module for talm
//!
//! Provides the subcommands:
//! - `talm init` - Create a project from a preset, or add a node to one
//! - `talm template` - Render machine configurations
//! - `talm apply` - Render and push machine configurations to nodes
//! - remote-admin commands (`logs`, `reboot`, `bootstrap`, ...) that wrap
//!   talosctl, see [`admin::REGISTRY`]

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, CommandFactory, FromArgMatches, Parser, Subcommand};

pub mod admin;
mod commands;
mod display;

pub use commands::*;
pub use display::*;

use crate::presets::DEFAULT_PRESET;
use crate::render::{
    RenderOptions, SecretsSource, DEFAULT_KUBERNETES_VERSION, DEFAULT_TALOS_VERSION,
};
use crate::talosconfig;

#[derive(Parser, Debug)]
#[command(name = "talm")]
#[command(about = "Manage Talos Linux configurations the GitOps way")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Flags shared by every subcommand
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Project root (the directory holding Chart.yaml)
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Target nodes, overriding modelines (comma separated)
    #[arg(short, long, global = true, value_delimiter = ',')]
    pub nodes: Vec<String>,

    /// Talos API endpoints, overriding modelines (comma separated)
    #[arg(short, long, global = true, value_delimiter = ',')]
    pub endpoints: Vec<String>,

    /// Client configuration (default: <root>/talosconfig, then ~/.talos/config)
    #[arg(long, global = true, env = "TALOSCONFIG")]
    pub talosconfig: Option<String>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,
}

impl Default for GlobalArgs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            nodes: Vec::new(),
            endpoints: Vec::new(),
            talosconfig: None,
            verbose: 0,
        }
    }
}

impl GlobalArgs {
    pub fn talosconfig_path(&self) -> PathBuf {
        talosconfig::resolve_path(self.talosconfig.as_deref(), &self.root)
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a project from a preset, or add a node to an existing one
    Init(InitArgs),

    /// Render templates into machine configurations
    Template(TemplateArgs),

    /// Render machine configurations and apply them to nodes
    Apply(ApplyArgs),
}

/// Arguments for the init command
#[derive(Parser, Debug, Clone)]
pub struct InitArgs {
    /// Preset to start from
    #[arg(long, default_value = DEFAULT_PRESET)]
    pub preset: String,

    /// Cluster name (default: the root directory's name)
    #[arg(long)]
    pub name: Option<String>,

    /// Kubernetes API endpoint, e.g. https://10.0.0.10:6443
    #[arg(long, value_name = "URL")]
    pub api_server: Option<String>,

    /// Talos version the secrets and configs are generated for
    #[arg(long, default_value = DEFAULT_TALOS_VERSION)]
    pub talos_version: String,

    /// Overwrite existing project files (node files are never overwritten)
    #[arg(long)]
    pub force: bool,

    /// Scan a network for nodes in maintenance mode
    #[arg(long, value_name = "CIDR")]
    pub scan: Option<String>,

    /// Node to write a node file for
    #[arg(long, value_name = "IP")]
    pub node: Option<String>,

    /// The node is a control-plane node
    #[arg(long, requires = "node")]
    pub controlplane: bool,

    /// Add a node to the project in --root instead of creating one
    #[arg(long, conflicts_with_all = ["name", "api_server"])]
    pub add_node: bool,

    /// List the built-in presets and exit
    #[arg(long)]
    pub list_presets: bool,
}

/// Render flags shared by template and apply
#[derive(Args, Debug, Clone, Default)]
pub struct RenderArgs {
    /// Template to render, relative to the root (repeatable)
    #[arg(short = 't', long = "template", value_name = "PATH")]
    pub templates: Vec<String>,

    /// Extra values file (repeatable, later files win)
    #[arg(long = "values", value_name = "PATH")]
    pub value_files: Vec<PathBuf>,

    /// Set a value (key=value, repeatable)
    #[arg(long = "set", value_name = "K=V")]
    pub set: Vec<String>,

    /// Set a value, always as a string
    #[arg(long = "set-string", value_name = "K=V")]
    pub set_string: Vec<String>,

    /// Set a value from a file's contents (key=@path)
    #[arg(long = "set-file", value_name = "K=@P")]
    pub set_file: Vec<String>,

    /// Set values from a JSON object or key=<json>
    #[arg(long = "set-json", value_name = "JSON")]
    pub set_json: Vec<String>,

    /// Render without contacting nodes
    #[arg(long)]
    pub offline: bool,

    /// Secrets bundle to use instead of <root>/secrets.yaml
    #[arg(long, value_name = "PATH", conflicts_with = "without_secrets")]
    pub with_secrets: Option<PathBuf>,

    /// Render without a secrets bundle
    #[arg(long)]
    pub without_secrets: bool,

    #[arg(long, default_value = DEFAULT_KUBERNETES_VERSION)]
    pub kubernetes_version: String,

    #[arg(long, default_value = DEFAULT_TALOS_VERSION)]
    pub talos_version: String,

    /// Record user@host in the modeline
    #[arg(long)]
    pub user_details: bool,

    /// Do not prefix documents with a modeline
    #[arg(long)]
    pub skip_modeline: bool,

    /// Node file: its modeline supplies nodes, endpoints and templates, its
    /// body is applied as a patch (repeatable)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    pub files: Vec<PathBuf>,
}

impl RenderArgs {
    /// Options for `root` without targets or templates.
    pub fn options(&self, root: &Path) -> RenderOptions {
        let mut opts = RenderOptions::new(root)
            .with_offline(self.offline)
            .with_talos_version(self.talos_version.clone())
            .with_modeline(!self.skip_modeline);
        opts.value_files = self.value_files.clone();
        opts.values = self.set.clone();
        opts.string_values = self.set_string.clone();
        opts.file_values = self.set_file.clone();
        opts.json_values = self.set_json.clone();
        opts.kubernetes_version = self.kubernetes_version.clone();
        opts.user_details = self.user_details;
        if self.without_secrets {
            opts = opts.with_secrets(SecretsSource::Without);
        } else if let Some(path) = &self.with_secrets {
            opts = opts.with_secrets(SecretsSource::Path(path.clone()));
        }
        opts
    }
}

/// Arguments for the template command
#[derive(Parser, Debug, Clone)]
pub struct TemplateArgs {
    #[command(flatten)]
    pub render: RenderArgs,

    /// Write the result back into each -f file
    #[arg(short = 'I', long)]
    pub in_place: bool,
}

/// Arguments for the apply command
#[derive(Parser, Debug, Clone)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub render: RenderArgs,

    /// Ask the nodes to validate the configuration without applying it
    #[arg(long)]
    pub dry_run: bool,

    /// Talk to nodes in maintenance mode, without client certificates
    #[arg(long)]
    pub insecure: bool,

    /// How the node applies the configuration
    #[arg(
        long,
        default_value = "auto",
        value_parser = ["auto", "interactive", "no-reboot", "reboot", "staged", "try"]
    )]
    pub mode: String,
}

/// A parsed command line.
#[derive(Debug)]
pub enum Invocation {
    Builtin(Cli),
    Remote {
        global: GlobalArgs,
        remote: admin::RemoteInvocation,
    },
}

impl Invocation {
    pub fn global(&self) -> &GlobalArgs {
        match self {
            Self::Builtin(cli) => &cli.global,
            Self::Remote { global, .. } => global,
        }
    }
}

/// The full command tree, remote-admin commands included.
pub fn command() -> clap::Command {
    admin::augment(Cli::command())
}

pub fn parse_from<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;
    if let Some((name, sub)) = matches.subcommand() {
        if let Some(remote) = admin::lookup(name) {
            return Ok(Invocation::Remote {
                global: GlobalArgs::from_arg_matches(sub)?,
                remote: admin::RemoteInvocation::from_matches(remote, sub),
            });
        }
    }
    Ok(Invocation::Builtin(Cli::from_arg_matches(&matches)?))
}

/// Run an invocation. Returns what should be printed on stdout.
pub async fn run(invocation: Invocation) -> CommandResult<String> {
    match invocation {
        Invocation::Builtin(cli) => match &cli.command {
            Commands::Init(args) => commands::init(&cli.global, args).await,
            Commands::Template(args) => commands::template(&cli.global, args).await,
            Commands::Apply(args) => commands::apply(&cli.global, args).await,
        },
        Invocation::Remote { global, remote } => {
            admin::run(&remote, &global).await?;
            Ok(String::new())
        }
    }
}
