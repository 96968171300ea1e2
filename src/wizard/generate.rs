//! The Generate step
//!
//! Produces a project (or one more node of an existing project) in six
//! steps. Nothing touches the disk until every output is known and
//! pre-checked; all files then go through one [`OutputTransaction`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::discovery::OfflineNodeApi;
use crate::engine::Chart;
use crate::observe::ObserverHandle;
use crate::presets::{self, LIBRARY_DIR};
use crate::render::{
    Overlay, OutputTransaction, RenderError, RenderOptions, Renderer, SecretsSource, NODES_DIR,
    SECRETS_FILE,
};
use crate::secrets::{self, serialize_bundle, SecretsBundle, VersionContract};
use crate::talosconfig::{self, serialize_talosconfig, TALOSCONFIG_FILE};

use super::data::{node_overlay, InitData, InitMode, NodeConfig};
use super::{WizardError, WizardEvent};

pub const STEPS: u8 = 6;

const FLOW: &str = "init";

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// `nodeN.yaml` with N one above the highest existing suffix.
pub fn next_node_name<I, S>(existing: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let highest = Regex::new(r"^node(\d+)\.yaml$").ok().and_then(|pattern| {
        existing
            .into_iter()
            .filter_map(|name| {
                pattern
                    .captures(name.as_ref())
                    .and_then(|caps| caps[1].parse::<u64>().ok())
            })
            .max()
    });
    format!("node{}.yaml", highest.unwrap_or(0) + 1)
}

// ============================================================================
// I/O boundary
// ============================================================================

struct Progress<'a> {
    observer: &'a ObserverHandle,
    events: Option<&'a mpsc::Sender<WizardEvent>>,
}

impl Progress<'_> {
    fn step(&self, step: u8, name: &str) {
        self.observer.step(FLOW, name);
        let percent = (u16::from(step) * 100 / u16::from(STEPS)) as u8;
        self.observer.progress(FLOW, percent);
        if let Some(events) = self.events {
            let _ = events.try_send(WizardEvent::GenerateProgress {
                step: name.to_string(),
                percent,
            });
        }
    }
}

/// Run the Generate step. Returns the files written.
pub async fn generate(
    data: &InitData,
    observer: &ObserverHandle,
    events: Option<&mpsc::Sender<WizardEvent>>,
) -> Result<Vec<PathBuf>, WizardError> {
    let progress = Progress { observer, events };
    let root = data.root.as_path();
    let mut tx = OutputTransaction::new();

    progress.step(1, "version");
    let contract = VersionContract::parse(&data.talos_version)?;

    let (chart, bundle) = match data.mode {
        InitMode::NewCluster => new_cluster(data, contract, &progress, &mut tx)?,
        InitMode::AddNode => {
            let bundle = secrets::load(&root.join(SECRETS_FILE))?;
            bundle.check_contract(contract)?;
            let chart = Chart::load(root).map_err(RenderError::Chart)?;
            (chart, bundle)
        }
    };

    if let Some(node) = &data.node {
        progress.step(6, "node");
        node.validate()?;
        let file = root.join(NODES_DIR).join(next_node_name(existing_node_files(root)?));
        let floating_ip = data
            .values
            .floating_ip
            .clone()
            .or_else(|| chart.values.get("floatingIP").and_then(|v| v.as_str()).map(str::to_string));
        let content = render_node(data, node, floating_ip.as_deref(), chart, bundle).await?;
        tx.write_private(file, content);
    }

    precheck(&tx, data.force)?;
    let written = tx.commit()?;
    info!(root = %root.display(), files = written.len(), "project generated");
    observer.finished(FLOW, true);
    Ok(written)
}

fn new_cluster(
    data: &InitData,
    contract: VersionContract,
    progress: &Progress<'_>,
    tx: &mut OutputTransaction,
) -> Result<(Chart, SecretsBundle), WizardError> {
    let root = data.root.as_path();
    let preset = presets::get(&data.preset).ok_or_else(|| {
        WizardError::Validation(format!(
            "unknown preset '{}', expected one of {}",
            data.preset,
            presets::names().join(", ")
        ))
    })?;
    let secrets_path = root.join(SECRETS_FILE);
    if secrets_path.exists() && !data.force {
        return Err(WizardError::Exists(secrets_path));
    }
    let cluster_name = data.effective_cluster_name();

    progress.step(2, "secrets");
    let bundle = secrets::generate(contract, data.now)?;
    tx.write_private(secrets_path, serialize_bundle(&bundle)?);

    progress.step(3, "talosconfig");
    let client_config = talosconfig::for_cluster(&cluster_name, &bundle, data.now)?;
    tx.write_private(root.join(TALOSCONFIG_FILE), serialize_talosconfig(&client_config)?);

    progress.step(4, "chart");
    let mut files = presets::materialize(preset, &cluster_name);
    if let Some(values) = files.get_mut("values.yaml") {
        *values = data
            .values
            .apply(values)
            .map_err(|e| WizardError::Preset(e.to_string()))?;
    }
    let (library, chart_files): (Vec<_>, Vec<_>) =
        files.iter().partition(|(path, _)| path.starts_with(LIBRARY_DIR));
    for (path, contents) in chart_files {
        tx.write(root.join(path), contents.as_str());
    }

    progress.step(5, "library");
    for (path, contents) in library {
        tx.write(root.join(path), contents.as_str());
    }

    let chart = Chart::from_files(files).map_err(RenderError::Chart)?;
    Ok((chart, bundle))
}

async fn render_node(
    data: &InitData,
    node: &NodeConfig,
    floating_ip: Option<&str>,
    chart: Chart,
    bundle: SecretsBundle,
) -> Result<String, WizardError> {
    let opts = RenderOptions::new(&data.root)
        .with_template(node.role.template())
        .with_secrets(SecretsSource::Bundle(Arc::new(bundle)))
        .with_offline(true)
        .with_nodes(vec![node.ip.clone()])
        .with_endpoints(vec![node.ip.clone()])
        .with_overlay(node.ip.clone(), Overlay::Inline(node_overlay(node, floating_ip)))
        .with_talos_version(data.talos_version.clone())
        .with_now(data.now);
    let rendered = Renderer::new(Arc::new(OfflineNodeApi))
        .render_chart(Arc::new(chart), &opts)
        .await?;
    debug!(node = %node.ip, documents = rendered.len(), "node configuration rendered");
    Ok(rendered.concatenated())
}

fn existing_node_files(root: &Path) -> Result<Vec<String>, WizardError> {
    let dir = root.join(NODES_DIR);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(WizardError::Io { path: dir, source }),
    };
    Ok(entries
        .filter_map(Result::ok)
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect())
}

/// Refuse to replace project files unless forced. Node files are never
/// replaced.
fn precheck(tx: &OutputTransaction, force: bool) -> Result<(), WizardError> {
    for target in tx.targets() {
        let is_node = target
            .parent()
            .and_then(Path::file_name)
            .is_some_and(|dir| dir == NODES_DIR);
        if target.exists() && (is_node || !force) {
            return Err(WizardError::Exists(target.to_path_buf()));
        }
    }
    Ok(())
}
