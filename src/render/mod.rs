//! Render orchestration
//!
//! Drives one render invocation: resolves values once, then for every
//! template and every target node merges the node overlay, binds the node's
//! discovery facts, evaluates the template on a blocking worker, and
//! post-processes the documents (re-parse, overlay patch, schema checks,
//! modeline prefix).

pub mod options;
mod output;
pub mod patch;
pub mod validate;

pub use options::{
    Overlay, RenderOptions, SecretsSource, DEFAULT_KUBERNETES_VERSION, DEFAULT_TALOS_VERSION,
    NODES_DIR, SECRETS_FILE,
};
pub use output::{OutputTransaction, FILE_MODE, PRIVATE_MODE};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::{
    BlockingFacts, ClientPool, DiscoveryClient, FactSource, NodeApi, OfflineNodeApi, UnboundFacts,
};
use crate::engine::{Chart, Engine, EngineError, RenderJob};
use crate::error::{Classify, ErrorKind};
use crate::modeline::{self, Modeline};
use crate::secrets::{self, SecretsBundle, SecretsError, VersionContract};
use crate::values::{self, parse_values_document, ValuesError};

/// How long a pooled discovery client may sit unused.
const POOL_MAX_IDLE: Duration = Duration::from_secs(60);
/// How long a pooled discovery client may live at all.
const POOL_MAX_LIFETIME: Duration = Duration::from_secs(300);

fn at(template: &str, node: &Option<String>) -> String {
    match node {
        Some(node) => format!("{template} (node {node})"),
        None => template.to_string(),
    }
}

/// Errors from a render invocation
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Values(#[from] ValuesError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("loading chart: {0}")]
    Chart(EngineError),

    #[error("{}: {source}", at(.template, .node))]
    Template {
        template: String,
        node: Option<String>,
        source: EngineError,
    },

    #[error("{}: document {index} is not valid YAML: {reason}", at(.template, .node))]
    Malformed {
        template: String,
        node: Option<String>,
        index: usize,
        reason: String,
    },

    #[error("{}: document {index}: {reason}", at(.template, .node))]
    Schema {
        template: String,
        node: Option<String>,
        index: usize,
        reason: String,
    },

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },

    #[error("render cancelled")]
    Cancelled,

    #[error("render worker failed: {0}")]
    Worker(String),
}

impl Classify for RenderError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Values(e) => e.kind(),
            Self::Secrets(e) => e.kind(),
            Self::Chart(e) => e.kind(),
            Self::Template { source, .. } => source.kind(),
            Self::Malformed { .. } => ErrorKind::OutputMalformed,
            Self::Schema { .. } => ErrorKind::SchemaMismatch,
            Self::Read { .. } | Self::Write { .. } => ErrorKind::Filesystem,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Worker(_) => ErrorKind::Internal,
        }
    }
}

/// One rendered document.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedDoc {
    /// `<template_stem>[.<node>][.<index>]`
    pub key: String,
    pub template: String,
    pub node: Option<String>,
    /// Position among the template's documents, when it yields several.
    pub index: Option<usize>,
    /// Modeline (unless disabled) followed by the YAML document.
    pub content: String,
}

/// Rendered documents in template, node, document order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderedSet {
    pub documents: Vec<RenderedDoc>,
}

impl RenderedSet {
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RenderedDoc> {
        self.documents.iter()
    }

    pub fn get(&self, key: &str) -> Option<&RenderedDoc> {
        self.documents.iter().find(|doc| doc.key == key)
    }

    /// Every document as one YAML stream.
    pub fn concatenated(&self) -> String {
        self.documents
            .iter()
            .map(|doc| doc.content.as_str())
            .collect::<Vec<_>>()
            .join("---\n")
    }
}

/// Renders charts into machine configurations.
pub struct Renderer {
    api: Arc<dyn NodeApi>,
    engine: Engine,
    cancel: CancellationToken,
}

impl Renderer {
    /// `api` is used for online renders; offline renders never touch it.
    pub fn new(api: Arc<dyn NodeApi>) -> Self {
        Self {
            api,
            engine: Engine::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn render(&self, opts: &RenderOptions) -> Result<RenderedSet, RenderError> {
        let chart = Chart::load(&opts.root).map_err(RenderError::Chart)?;
        self.render_chart(Arc::new(chart), opts).await
    }

    /// Render a chart that is not (yet) on disk. `opts.root` still anchors
    /// value files and overlays.
    pub async fn render_chart(
        &self,
        chart: Arc<Chart>,
        opts: &RenderOptions,
    ) -> Result<RenderedSet, RenderError> {
        let contract = VersionContract::parse(&opts.talos_version)?;
        let secrets = load_secrets(opts, contract)?;
        let values = opts.value_sources().resolve(&chart.values)?;

        let targets: Vec<Option<String>> = if opts.nodes.is_empty() {
            vec![None]
        } else {
            opts.nodes.iter().cloned().map(Some).collect()
        };
        info!(
            chart = %chart.name,
            templates = opts.template_files.len(),
            nodes = opts.nodes.len(),
            offline = opts.offline,
            "rendering"
        );

        let pool: ClientPool<DiscoveryClient> = ClientPool::new(POOL_MAX_IDLE, POOL_MAX_LIFETIME);
        let offline_api: Arc<dyn NodeApi> = Arc::new(OfflineNodeApi);
        let handle = tokio::runtime::Handle::current();
        let mut rendered = RenderedSet::default();

        for template_file in &opts.template_files {
            let template = opts.chart_path(template_file);
            if self.cancel.is_cancelled() {
                return Err(RenderError::Cancelled);
            }

            for node in &targets {
                if self.cancel.is_cancelled() {
                    return Err(RenderError::Cancelled);
                }

                let overlay = match node {
                    Some(node) => opts
                        .overlay_for(node)
                        .map(|overlay| load_overlay(opts, &overlay))
                        .transpose()?,
                    None => None,
                };
                let mut node_values = values.clone();
                if let Some(overlay) = &overlay {
                    values::merge(&mut node_values, overlay.clone())?;
                }

                let facts: Arc<dyn FactSource> = match (node, opts.offline) {
                    (None, false) => Arc::new(UnboundFacts),
                    (node, offline) => {
                        let name = node.clone().unwrap_or_default();
                        let api = if offline { offline_api.clone() } else { self.api.clone() };
                        let cancel = self.cancel.child_token();
                        let client = pool.get(&name, || DiscoveryClient::new(name.clone(), api, cancel));
                        Arc::new(BlockingFacts::new(client, handle.clone()))
                    }
                };

                let job = RenderJob {
                    chart: chart.clone(),
                    template: template.clone(),
                    values: node_values,
                    node: node.clone(),
                    offline: opts.offline,
                    talos_version: opts.talos_version.clone(),
                    kubernetes_version: opts.kubernetes_version.clone(),
                    facts,
                    secrets: secrets.clone(),
                    now: opts.now,
                };
                let engine = self.engine;
                let text = tokio::task::spawn_blocking(move || engine.render(&job))
                    .await
                    .map_err(|e| RenderError::Worker(e.to_string()))?
                    .map_err(|source| RenderError::Template {
                        template: template.clone(),
                        node: node.clone(),
                        source,
                    })?;

                let documents = postprocess(&text, &template, node, overlay.as_ref())?;
                let several = documents.len() > 1;
                for (index, body) in documents.into_iter().enumerate() {
                    let key = document_key(&template, node.as_deref(), several.then_some(index));
                    debug!(%key, "rendered document");
                    let content = if opts.templates_have_modeline {
                        format!("{}\n{}", modeline::generate(&modeline_for(opts, &template, node)), body)
                    } else {
                        body
                    };
                    rendered.documents.push(RenderedDoc {
                        key,
                        template: template.clone(),
                        node: node.clone(),
                        index: several.then_some(index),
                        content,
                    });
                }
            }
        }
        Ok(rendered)
    }
}

fn load_secrets(
    opts: &RenderOptions,
    contract: VersionContract,
) -> Result<Option<Arc<SecretsBundle>>, RenderError> {
    match opts.secrets_source() {
        SecretsSource::Without => Ok(None),
        SecretsSource::Bundle(bundle) => {
            bundle.check_contract(contract)?;
            Ok(Some(bundle))
        }
        SecretsSource::Path(path) => match secrets::load(&opts.resolve(&path)) {
            Ok(bundle) => {
                bundle.check_contract(contract)?;
                Ok(Some(Arc::new(bundle)))
            }
            Err(SecretsError::Missing(path)) if opts.offline => {
                debug!(path = %path.display(), "no secrets bundle, rendering offline without secrets");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        },
    }
}

fn load_overlay(opts: &RenderOptions, overlay: &Overlay) -> Result<Value, RenderError> {
    match overlay {
        Overlay::Inline(value) => {
            if !value.is_object() {
                return Err(ValuesError::Shape {
                    origin: "inline overlay".to_string(),
                    found: values::type_name(value),
                }
                .into());
            }
            Ok(value.clone())
        }
        Overlay::File(path) => {
            let path = opts.resolve(path);
            let content = std::fs::read_to_string(&path).map_err(|e| RenderError::Read {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            overlay_document(&content, &path)
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// The first document of an overlay file, without its modeline.
fn overlay_document(content: &str, path: &Path) -> Result<Value, RenderError> {
    let body = modeline::strip(content);
    let first = validate::split_documents(body).into_iter().next().unwrap_or_default();
    Ok(parse_values_document(&first, &path.display().to_string())?)
}

/// Split, re-parse, patch and check one template's output.
fn postprocess(
    text: &str,
    template: &str,
    node: &Option<String>,
    overlay: Option<&Value>,
) -> Result<Vec<String>, RenderError> {
    let mut documents = Vec::new();
    for (index, raw) in validate::split_documents(text).into_iter().enumerate() {
        let parsed = validate::parse_document(&raw).map_err(|reason| RenderError::Malformed {
            template: template.to_string(),
            node: node.clone(),
            index,
            reason,
        })?;
        let Some(mut doc) = parsed else {
            continue;
        };

        let machine_config = validate::is_machine_config(&doc);
        let body = match overlay {
            Some(overlay) if machine_config => {
                patch::apply_patch(&mut doc, overlay);
                serde_yaml::to_string(&doc).map_err(|e| RenderError::Malformed {
                    template: template.to_string(),
                    node: node.clone(),
                    index,
                    reason: e.to_string(),
                })?
            }
            _ => raw,
        };
        validate::check_document(&doc, overlay.is_some() && machine_config).map_err(|reason| {
            RenderError::Schema {
                template: template.to_string(),
                node: node.clone(),
                index,
                reason,
            }
        })?;

        documents.push(if body.ends_with('\n') { body } else { format!("{body}\n") });
    }
    Ok(documents)
}

pub fn document_key(template: &str, node: Option<&str>, index: Option<usize>) -> String {
    let stem = Path::new(template)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| template.to_string());
    let mut key = stem;
    if let Some(node) = node {
        key.push('.');
        key.push_str(node);
    }
    if let Some(index) = index {
        key.push('.');
        key.push_str(&index.to_string());
    }
    key
}

fn modeline_for(opts: &RenderOptions, template: &str, node: &Option<String>) -> Modeline {
    let modeline = Modeline::new(
        node.iter().cloned().collect(),
        opts.endpoints.clone(),
        vec![template.to_string()],
    );
    if opts.user_details {
        modeline.with_user(user_details())
    } else {
        modeline
    }
}

/// `user@host` of the workstation running the render.
pub fn user_details() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{user}@{host}")
}
