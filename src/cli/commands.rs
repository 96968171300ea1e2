//! Command implementations for the CLI
//!
//! SBIO pattern: commands return the text to print, the caller does the
//! printing. Planning helpers are pure; talosctl and the filesystem are only
//! touched by the command functions themselves.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{DiscoveryClient, DiscoveryError, TalosctlApi};
use crate::error::{Classify, ErrorKind};
use crate::modeline::{self, ModelineError, Targets};
use crate::observe::{ObserverHandle, TracingObserver};
use crate::presets;
use crate::render::{Overlay, OutputTransaction, RenderError, RenderOptions, RenderedSet, Renderer};
use crate::scanner::{NodeInfo, Scanner};
use crate::talosconfig::TalosconfigError;
use crate::wizard::{
    run_generate, run_scan, Controller, InitData, Intent, NodeConfig, NodeRole, WizardError,
    WizardEvent, WizardState,
};

use super::admin;
use super::display::{format_node_list, format_preset_list, format_written};
use super::{ApplyArgs, GlobalArgs, InitArgs, RenderArgs, TemplateArgs};

/// Errors that can occur during command execution
#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Render(#[from] RenderError),

    #[error(transparent)]
    Wizard(#[from] WizardError),

    #[error(transparent)]
    Modeline(#[from] ModelineError),

    #[error(transparent)]
    Talosconfig(#[from] TalosconfigError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("{0}")]
    Usage(String),

    /// A background job reported failure.
    #[error("{message}")]
    Failed { kind: ErrorKind, message: String },

    #[error("{0}")]
    Talosctl(String),

    #[error("talosctl exited with status {0}")]
    ChildExit(i32),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Classify for CommandError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Render(e) => e.kind(),
            Self::Wizard(e) => e.kind(),
            Self::Modeline(e) => e.kind(),
            Self::Talosconfig(e) => e.kind(),
            Self::Discovery(e) => e.kind(),
            Self::Usage(_) => ErrorKind::Validation,
            Self::Failed { kind, .. } => *kind,
            Self::Talosctl(_) | Self::ChildExit(_) => ErrorKind::DiscoveryUnavailable,
            Self::Io { .. } => ErrorKind::Filesystem,
        }
    }
}

impl CommandError {
    /// Process exit code. A failing talosctl passes its own status through.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ChildExit(code) => *code,
            other => other.kind().exit_code(),
        }
    }
}

/// Result type for commands
pub type CommandResult<T> = Result<T, CommandError>;

// ============================================================================
// Planning (pure)
// ============================================================================

/// One render: the node file it came from (if any) and its options.
#[derive(Debug, Clone)]
pub struct RenderPlan {
    pub file: Option<PathBuf>,
    pub opts: RenderOptions,
}

/// Build the renders for `args`: one per `-f` file, or a single one driven
/// by `-t` and the global targets.
///
/// For a file, global nodes and endpoints win over its modeline, `-t` wins
/// over the modeline's templates, and the file body becomes every node's
/// overlay.
pub fn plan_renders(global: &GlobalArgs, args: &RenderArgs) -> CommandResult<Vec<RenderPlan>> {
    let base = args.options(&global.root);

    if args.files.is_empty() {
        if args.templates.is_empty() {
            return Err(CommandError::Usage(
                "nothing to render: pass -t/--template or -f/--file".to_string(),
            ));
        }
        let targets = Targets::resolve(&global.nodes, &global.endpoints, None);
        let mut opts = base.with_nodes(targets.nodes).with_endpoints(targets.endpoints);
        opts.template_files = args.templates.clone();
        return Ok(vec![RenderPlan { file: None, opts }]);
    }

    let mut plans = Vec::with_capacity(args.files.len());
    for file in &args.files {
        let line = modeline::read_from_file(file)?;
        let targets = Targets::resolve(&global.nodes, &global.endpoints, Some(&line));
        let templates = if args.templates.is_empty() {
            line.templates.clone()
        } else {
            args.templates.clone()
        };
        if templates.is_empty() {
            return Err(CommandError::Usage(format!(
                "{}: no templates given and the modeline names none",
                file.display()
            )));
        }

        let overlay = absolute(file)?;
        let mut opts = base
            .clone()
            .with_nodes(targets.nodes.clone())
            .with_endpoints(targets.endpoints);
        opts.template_files = templates;
        for node in &targets.nodes {
            opts = opts.with_overlay(node.clone(), Overlay::File(overlay.clone()));
        }
        if targets.nodes.is_empty() {
            warn!(file = %file.display(), "no nodes for file, rendering without its patch");
        }
        plans.push(RenderPlan {
            file: Some(file.clone()),
            opts,
        });
    }
    Ok(plans)
}

/// Documents rendered for `node`, as one YAML stream.
pub fn node_config(set: &RenderedSet, node: &str) -> String {
    set.iter()
        .filter(|doc| doc.node.as_deref() == Some(node))
        .map(|doc| doc.content.as_str())
        .collect::<Vec<_>>()
        .join("---\n")
}

/// talosctl arguments for applying `config` to one node.
pub fn apply_args(
    args: &ApplyArgs,
    talosconfig: &Path,
    node: &str,
    endpoints: &[String],
    config: &Path,
) -> Vec<String> {
    let mut out = vec!["apply-config".to_string()];
    if args.insecure {
        out.push("--insecure".to_string());
    } else {
        out.push("--talosconfig".to_string());
        out.push(talosconfig.display().to_string());
    }
    out.push("--nodes".to_string());
    out.push(node.to_string());
    if !endpoints.is_empty() {
        out.push("--endpoints".to_string());
        out.push(endpoints.join(","));
    }
    out.push("--file".to_string());
    out.push(config.display().to_string());
    out.push("--mode".to_string());
    out.push(args.mode.clone());
    if args.dry_run {
        out.push("--dry-run".to_string());
    }
    out
}

/// Kubernetes endpoint for init: explicit, derived from a control-plane
/// node, or the preset's default.
pub fn init_endpoint(args: &InitArgs) -> Option<String> {
    if let Some(endpoint) = &args.api_server {
        return Some(endpoint.clone());
    }
    if args.controlplane {
        if let Some(node) = &args.node {
            return Some(match node.parse::<IpAddr>() {
                Ok(IpAddr::V6(ip)) => format!("https://[{ip}]:6443"),
                _ => format!("https://{node}:6443"),
            });
        }
    }
    presets::get(&args.preset).and_then(|preset| preset.default_endpoint())
}

fn failure(terminal: Option<WizardEvent>) -> CommandError {
    match terminal {
        Some(WizardEvent::ScanFailed { message, kind, .. })
        | Some(WizardEvent::GenerateFailed { message, kind }) => CommandError::Failed { kind, message },
        _ => CommandError::Failed {
            kind: ErrorKind::Internal,
            message: "wizard stopped without a result".to_string(),
        },
    }
}

// ============================================================================
// I/O boundary
// ============================================================================

fn absolute(path: &Path) -> CommandResult<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(|source| CommandError::Io {
        path: PathBuf::from("."),
        source,
    })?;
    Ok(cwd.join(path))
}

/// A token cancelled on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

fn renderer(global: &GlobalArgs, opts: &RenderOptions, insecure: bool, cancel: &CancellationToken) -> Renderer {
    let api = TalosctlApi::new()
        .with_talosconfig(global.talosconfig_path())
        .with_endpoints(opts.endpoints.clone())
        .with_insecure(insecure);
    Renderer::new(Arc::new(api)).with_cancel(cancel.clone())
}

/// Feed wizard events into the controller until the sender is gone.
/// Returns the terminal event.
async fn pump(
    wizard: &mut Controller,
    mut events: mpsc::Receiver<WizardEvent>,
) -> CommandResult<Option<WizardEvent>> {
    let mut terminal = None;
    while let Some(event) = events.recv().await {
        match &event {
            WizardEvent::ScanProgress(percent) => debug!(percent, "scan progress"),
            WizardEvent::GenerateProgress { step, percent } => debug!(%step, percent, "generate progress"),
            _ => terminal = Some(event.clone()),
        }
        wizard.on_event(event)?;
    }
    Ok(terminal)
}

pub async fn template(global: &GlobalArgs, args: &TemplateArgs) -> CommandResult<String> {
    if args.in_place && args.render.files.is_empty() {
        return Err(CommandError::Usage("--in-place needs at least one -f/--file".to_string()));
    }
    let plans = plan_renders(global, &args.render)?;
    let cancel = cancel_on_ctrl_c();

    let mut rendered = Vec::with_capacity(plans.len());
    for plan in &plans {
        if args.in_place && plan.opts.nodes.len() > 1 {
            return Err(CommandError::Usage(format!(
                "{}: in-place rendering needs a single node, got {}",
                plan.file.as_deref().unwrap_or(Path::new("-")).display(),
                plan.opts.nodes.len()
            )));
        }
        let set = renderer(global, &plan.opts, false, &cancel).render(&plan.opts).await?;
        info!(documents = set.len(), "rendered");
        rendered.push((plan.file.clone(), set));
    }

    if !args.in_place {
        let streams: Vec<String> = rendered.iter().map(|(_, set)| set.concatenated()).collect();
        return Ok(streams.join("---\n"));
    }

    let mut tx = OutputTransaction::new();
    for (file, set) in rendered {
        if let Some(file) = file {
            tx.write_private(file, set.concatenated());
        }
    }
    let written = tx.commit()?;
    Ok(written
        .iter()
        .map(|path| format!("  updated {}\n", path.display()))
        .collect())
}

pub async fn apply(global: &GlobalArgs, args: &ApplyArgs) -> CommandResult<String> {
    let plans = plan_renders(global, &args.render)?;
    let talosconfig = global.talosconfig_path();
    let cancel = cancel_on_ctrl_c();
    let mut output = String::new();

    for plan in &plans {
        let source = plan
            .file
            .as_deref()
            .map(|f| f.display().to_string())
            .unwrap_or_else(|| "templates".to_string());
        if plan.opts.nodes.is_empty() {
            return Err(CommandError::Usage(format!(
                "{source}: no nodes to apply to; pass -n/--nodes or a file with a modeline"
            )));
        }
        let set = renderer(global, &plan.opts, args.insecure, &cancel)
            .render(&plan.opts)
            .await?;

        for node in &plan.opts.nodes {
            let staged = tempfile::Builder::new()
                .prefix("talm-")
                .suffix(".yaml")
                .tempfile()
                .map_err(|source| CommandError::Io {
                    path: std::env::temp_dir(),
                    source,
                })?;
            std::fs::write(staged.path(), node_config(&set, node)).map_err(|source| CommandError::Io {
                path: staged.path().to_path_buf(),
                source,
            })?;

            info!(%node, %source, dry_run = args.dry_run, "applying");
            admin::talosctl(&apply_args(args, &talosconfig, node, &plan.opts.endpoints, staged.path())).await?;
            output.push_str(&format!("  applied {source} to {node}\n"));
        }
    }
    Ok(output)
}

pub async fn init(global: &GlobalArgs, args: &InitArgs) -> CommandResult<String> {
    if args.list_presets {
        return Ok(format_preset_list(presets::all()));
    }

    let observer: ObserverHandle = Arc::new(TracingObserver);
    let cancel = cancel_on_ctrl_c();
    let role = if args.controlplane {
        NodeRole::ControlPlane
    } else {
        NodeRole::Worker
    };
    let data = InitData::new(&global.root).with_talos_version(args.talos_version.clone());
    let mut wizard = Controller::new(data);
    let mut output = String::new();

    if args.add_node {
        wizard.handle(Intent::AddNodes)?;
        match &args.scan {
            Some(cidr) => wizard.handle(Intent::StartScan { cidr: cidr.clone() })?,
            None => wizard.handle(Intent::SkipScan)?,
        };
    } else {
        wizard.handle(Intent::ChoosePreset {
            preset: args.preset.clone(),
            cluster_name: args.name.clone().unwrap_or_default(),
        })?;
        let endpoint = init_endpoint(args)
            .ok_or_else(|| CommandError::Usage("--api-server is required for this preset".to_string()))?;
        wizard.handle(Intent::SubmitEndpoint {
            endpoint,
            scan: args.scan.clone(),
        })?;
    }

    if wizard.state() == WizardState::Scanning {
        let cidr = wizard.data().scan_cidr.clone().unwrap_or_default();
        let scanner = Scanner::new(Arc::new(TalosctlApi::new().with_insecure(true)))
            .with_cancel(cancel.clone())
            .with_observer(observer.clone());
        let (tx, rx) = mpsc::channel(64);
        let job = async move { run_scan(&scanner, &cidr, &tx).await };
        let ((), terminal) = tokio::join!(job, pump(&mut wizard, rx));
        let terminal = terminal?;
        if wizard.state() != WizardState::NodeSelect {
            return Err(failure(terminal));
        }
        output.push_str(&format_node_list(&wizard.data().discovered));
    }

    match &args.node {
        None => {
            wizard.handle(Intent::SelectNode { ip: None, role })?;
            wizard.handle(Intent::ConfigureNode(None))?;
        }
        Some(ip) => {
            wizard.handle(Intent::SelectNode {
                ip: Some(ip.clone()),
                role,
            })?;
            let node = match wizard.data().discovered.iter().any(|n| n.ip.to_string() == *ip) {
                true => wizard.data().node.clone(),
                false => Some(describe_node(ip, role, &cancel).await?),
            };
            wizard.handle(Intent::ConfigureNode(node))?;
        }
    }

    wizard.handle(Intent::Confirm { force: args.force })?;
    let data = wizard.data().clone();
    let (tx, rx) = mpsc::channel(64);
    let job = {
        let observer = observer.clone();
        async move { run_generate(&data, &observer, &tx).await }
    };
    let ((), terminal) = tokio::join!(job, pump(&mut wizard, rx));
    let terminal = terminal?;

    match terminal {
        Some(WizardEvent::GenerateFinished(files)) if wizard.state() == WizardState::Done => {
            output.push_str(&format!("Project written to {}\n", global.root.display()));
            output.push_str(&format_written(&global.root, &files));
            Ok(output)
        }
        other => Err(failure(other)),
    }
}

/// Read a node's facts directly (maintenance mode) and prefill its config.
async fn describe_node(ip: &str, role: NodeRole, cancel: &CancellationToken) -> CommandResult<NodeConfig> {
    let addr: IpAddr = ip
        .parse()
        .map_err(|_| CommandError::Usage(format!("'{ip}' is not an IP address")))?;
    let api = Arc::new(TalosctlApi::new().with_insecure(true));
    let facts = DiscoveryClient::new(ip, api, cancel.child_token()).facts().await?;
    Ok(NodeConfig::from_node(&NodeInfo::new(addr, facts), role))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{RenderedDoc, SecretsSource};

    fn render_args() -> RenderArgs {
        RenderArgs {
            talos_version: "v1.9.0".into(),
            kubernetes_version: "v1.31.2".into(),
            ..RenderArgs::default()
        }
    }

    fn apply_args_for(dry_run: bool, insecure: bool) -> ApplyArgs {
        ApplyArgs {
            render: render_args(),
            dry_run,
            insecure,
            mode: "auto".into(),
        }
    }

    fn init_args() -> InitArgs {
        InitArgs {
            preset: "generic".into(),
            name: None,
            api_server: None,
            talos_version: "v1.9.0".into(),
            force: false,
            scan: None,
            node: None,
            controlplane: false,
            add_node: false,
            list_presets: false,
        }
    }

    #[test]
    fn test_plan_requires_input() {
        let err = plan_renders(&GlobalArgs::default(), &render_args()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_plan_from_templates() {
        let global = GlobalArgs {
            nodes: vec!["10.0.0.2".into()],
            ..GlobalArgs::default()
        };
        let args = RenderArgs {
            templates: vec!["templates/worker.yaml".into()],
            without_secrets: true,
            ..render_args()
        };
        let plans = plan_renders(&global, &args).unwrap();
        assert_eq!(plans.len(), 1);
        assert!(plans[0].file.is_none());
        assert_eq!(plans[0].opts.nodes, vec!["10.0.0.2"]);
        assert_eq!(plans[0].opts.template_files, vec!["templates/worker.yaml"]);
        assert_eq!(plans[0].opts.secrets, Some(SecretsSource::Without));
        assert!(plans[0].opts.overlays.is_empty());
    }

    #[test]
    fn test_plan_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("node1.yaml");
        std::fs::write(
            &file,
            "# talm: nodes=[\"10.0.0.2\"], endpoints=[\"10.0.0.9\"], templates=[\"templates/controlplane.yaml\"]\nmachine:\n  type: controlplane\n",
        )
        .unwrap();
        let args = RenderArgs {
            files: vec![file.clone()],
            ..render_args()
        };

        let plans = plan_renders(&GlobalArgs::default(), &args).unwrap();
        let opts = &plans[0].opts;
        assert_eq!(opts.nodes, vec!["10.0.0.2"]);
        assert_eq!(opts.endpoints, vec!["10.0.0.9"]);
        assert_eq!(opts.template_files, vec!["templates/controlplane.yaml"]);
        assert_eq!(opts.overlays.get("10.0.0.2"), Some(&Overlay::File(file.clone())));

        let args = RenderArgs {
            templates: vec!["templates/worker.yaml".into()],
            ..args
        };
        let global = GlobalArgs {
            endpoints: vec!["10.0.0.1".into()],
            ..GlobalArgs::default()
        };
        let plans = plan_renders(&global, &args).unwrap();
        assert_eq!(plans[0].opts.template_files, vec!["templates/worker.yaml"]);
        assert_eq!(plans[0].opts.endpoints, vec!["10.0.0.1"]);
    }

    #[test]
    fn test_plan_file_without_templates() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("node1.yaml");
        std::fs::write(&file, "# talm: nodes=[\"10.0.0.2\"], endpoints=[], templates=[]\n").unwrap();
        let args = RenderArgs {
            files: vec![file],
            ..render_args()
        };
        let err = plan_renders(&GlobalArgs::default(), &args).unwrap_err();
        assert!(err.to_string().contains("no templates"));
    }

    #[test]
    fn test_node_config_selects_node_documents() {
        let doc = |node: &str, content: &str| RenderedDoc {
            key: format!("worker.{node}"),
            template: "templates/worker.yaml".into(),
            node: Some(node.into()),
            index: None,
            content: content.into(),
        };
        let set = RenderedSet {
            documents: vec![doc("a", "one\n"), doc("b", "two\n"), doc("a", "three\n")],
        };
        assert_eq!(node_config(&set, "a"), "one\n---\nthree\n");
        assert_eq!(node_config(&set, "c"), "");
    }

    #[test]
    fn test_apply_args() {
        let args = apply_args(
            &apply_args_for(true, false),
            Path::new("/work/talosconfig"),
            "10.0.0.2",
            &["10.0.0.9".into()],
            Path::new("/tmp/talm-x.yaml"),
        );
        assert_eq!(
            args,
            vec![
                "apply-config",
                "--talosconfig",
                "/work/talosconfig",
                "--nodes",
                "10.0.0.2",
                "--endpoints",
                "10.0.0.9",
                "--file",
                "/tmp/talm-x.yaml",
                "--mode",
                "auto",
                "--dry-run"
            ]
        );

        let insecure = apply_args(&apply_args_for(false, true), Path::new("tc"), "10.0.0.2", &[], Path::new("c"));
        assert_eq!(
            insecure,
            vec!["apply-config", "--insecure", "--nodes", "10.0.0.2", "--file", "c", "--mode", "auto"]
        );
    }

    #[test]
    fn test_init_endpoint() {
        assert_eq!(init_endpoint(&init_args()).as_deref(), Some("https://192.168.100.10:6443"));

        let args = InitArgs {
            node: Some("10.0.0.2".into()),
            controlplane: true,
            ..init_args()
        };
        assert_eq!(init_endpoint(&args).as_deref(), Some("https://10.0.0.2:6443"));

        let args = InitArgs {
            node: Some("fd00::2".into()),
            controlplane: true,
            ..init_args()
        };
        assert_eq!(init_endpoint(&args).as_deref(), Some("https://[fd00::2]:6443"));

        let args = InitArgs {
            api_server: Some("https://vip:6443".into()),
            ..args
        };
        assert_eq!(init_endpoint(&args).as_deref(), Some("https://vip:6443"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(CommandError::ChildExit(7).exit_code(), 7);
        assert_eq!(CommandError::Talosctl("missing".into()).exit_code(), 5);
        let failed = CommandError::Failed {
            kind: ErrorKind::FilesystemExists,
            message: "x".into(),
        };
        assert_eq!(failed.exit_code(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_init_minimal_project() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("demo");
        std::fs::create_dir_all(&root).unwrap();
        let global = GlobalArgs {
            root: root.clone(),
            ..GlobalArgs::default()
        };

        let output = init(&global, &init_args()).await.unwrap();
        assert!(output.contains("created secrets.yaml"));
        assert!(root.join("Chart.yaml").is_file());
        assert!(root.join("charts/talm/Chart.yaml").is_file());
        assert!(!root.join("nodes").exists());

        let err = init(&global, &init_args()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FilesystemExists);
        assert_eq!(err.exit_code(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_template_after_init() {
        let dir = tempfile::tempdir().unwrap();
        let global = GlobalArgs {
            root: dir.path().to_path_buf(),
            nodes: vec!["10.0.0.2".into()],
            ..GlobalArgs::default()
        };
        init(&global, &init_args()).await.unwrap();

        let args = TemplateArgs {
            render: RenderArgs {
                templates: vec!["templates/controlplane.yaml".into()],
                offline: true,
                ..render_args()
            },
            in_place: false,
        };
        let output = template(&global, &args).await.unwrap();
        assert!(output.starts_with("# talm: nodes=[\"10.0.0.2\"]"));
        assert!(output.contains("type: controlplane"));
    }

    #[tokio::test]
    async fn test_in_place_requires_files() {
        let args = TemplateArgs {
            render: RenderArgs {
                templates: vec!["templates/worker.yaml".into()],
                ..render_args()
            },
            in_place: true,
        };
        let err = template(&GlobalArgs::default(), &args).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
