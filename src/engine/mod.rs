//! Template engine
//!
//! Charts are rendered with handlebars. Every render builds a fresh registry
//! holding the chart's partials, the requested template and the function
//! library from [`helpers`], all bound to the collaborators of that render:
//! the discovery facts of one node and the (optional) secrets bundle.
//!
//! Evaluation is bounded: helper calls and output writes consume a step
//! budget, and output size is capped. Helpers report structured failures
//! through a [`budget::FailureSlot`] so errors keep their taxonomy after
//! passing through handlebars' opaque error type.

pub mod budget;
pub mod chart;
mod helpers;

pub use budget::{DEFAULT_MAX_OUTPUT, DEFAULT_MAX_STEPS};
pub use chart::{partial_name, Chart};
pub use helpers::HelperEnv;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use crate::discovery::{DiscoveryError, FactSource};
use crate::error::{Classify, ErrorKind};
use crate::secrets::SecretsBundle;
use budget::{BoundedWriter, Budget, Failure, FailureSlot};

/// Where in the chart an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Location {
    pub template: String,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Location {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            line: None,
            column: None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.column) {
            (Some(line), Some(column)) => write!(f, "{}:{}:{}", self.template, line, column),
            (Some(line), None) => write!(f, "{}:{}", self.template, line),
            _ => write!(f, "{}", self.template),
        }
    }
}

/// Errors raised while loading or rendering a chart
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("{location}: parse error: {reason}")]
    Parse { location: Location, reason: String },

    #[error("{location}: {message}{}", path.as_ref().map(|p| format!(" (at {p})")).unwrap_or_default())]
    Eval {
        location: Location,
        message: String,
        path: Option<String>,
    },

    #[error("{location}: template too complex: {reason}")]
    TooComplex { location: Location, reason: String },

    #[error("{location}: fact \"{fact}\" needs a live node but rendering is offline")]
    OfflineFactRequired { location: Location, fact: String },

    #[error("{location}: secret \"{path}\" not found in the secrets bundle")]
    SecretPathMissing { location: Location, path: String },

    #[error("{location}: secret \"{path}\" requested while rendering without secrets")]
    SecretsMissing { location: Location, path: String },

    #[error("{location}: discovering \"{fact}\": {source}")]
    Discovery {
        location: Location,
        fact: String,
        source: DiscoveryError,
    },

    #[error("template '{0}' not found in chart")]
    NotFound(String),

    #[error("invalid chart file {path}: {reason}")]
    ChartInvalid { path: String, reason: String },

    #[error("failed to read {path}: {reason}")]
    ChartRead { path: String, reason: String },
}

impl Classify for EngineError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Parse { .. } => ErrorKind::TemplateParse,
            Self::Eval { .. } => ErrorKind::TemplateEval,
            Self::TooComplex { .. } => ErrorKind::TemplateTooComplex,
            Self::OfflineFactRequired { .. } => ErrorKind::OfflineFactRequired,
            Self::SecretPathMissing { .. } => ErrorKind::SecretPathMissing,
            Self::SecretsMissing { .. } => ErrorKind::SecretsMissing,
            Self::Discovery { source, .. } => source.kind(),
            Self::NotFound(_) | Self::ChartInvalid { .. } => ErrorKind::Validation,
            Self::ChartRead { .. } => ErrorKind::Filesystem,
        }
    }
}

/// Everything one template render needs. Owned so it can move onto a
/// blocking worker.
#[derive(Clone)]
pub struct RenderJob {
    pub chart: Arc<Chart>,
    pub template: String,
    pub values: Value,
    pub node: Option<String>,
    pub offline: bool,
    pub talos_version: String,
    pub kubernetes_version: String,
    pub facts: Arc<dyn FactSource>,
    pub secrets: Option<Arc<SecretsBundle>>,
    pub now: DateTime<Utc>,
}

/// Renders chart templates within a step and output budget.
#[derive(Debug, Clone, Copy)]
pub struct Engine {
    max_steps: u64,
    max_output: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            max_output: DEFAULT_MAX_OUTPUT,
        }
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Render one template of the job's chart.
    pub fn render(&self, job: &RenderJob) -> Result<String, EngineError> {
        let template = job.template.trim_start_matches("./").to_string();
        let source = job
            .chart
            .template(&template)
            .ok_or_else(|| EngineError::NotFound(template.clone()))?;

        let failures = FailureSlot::default();
        let budget = Arc::new(Budget::new(self.max_steps, failures.clone()));
        let env = HelperEnv {
            budget: budget.clone(),
            failures: failures.clone(),
            facts: job.facts.clone(),
            secrets: job.secrets.clone(),
            now: job.now,
        };

        let mut registry = Handlebars::new();
        registry.register_escape_fn(handlebars::no_escape);
        helpers::register(&mut registry, &env);

        let mut paths: HashMap<String, String> = HashMap::new();
        for (name, partial) in job.chart.partials() {
            registry
                .register_partial(&name, partial.source)
                .map_err(|e| parse_error(partial.path, &e.to_string()))?;
            paths.insert(name, partial.path.to_string());
        }
        registry
            .register_template_string(&template, source)
            .map_err(|e| parse_error(&template, &e.to_string()))?;

        let data = context_data(job, &template);
        let mut writer = BoundedWriter::new(budget.clone(), failures.clone(), self.max_output);
        let rendered = registry.render_to_write(&template, &data, &mut writer);
        debug!(template = %template, node = ?job.node, steps = budget.used(), "rendered template");

        match rendered {
            Ok(()) => String::from_utf8(writer.into_inner()).map_err(|_| EngineError::Eval {
                location: Location::new(&template),
                message: "rendered output is not valid UTF-8".to_string(),
                path: None,
            }),
            Err(e) => {
                let (location, description) = locate(&e.to_string(), &template, &paths);
                Err(classify_failure(failures.take(), location, description))
            }
        }
    }
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Root data every template sees.
fn context_data(job: &RenderJob, template: &str) -> Value {
    json!({
        "Values": job.values,
        "Chart": {"name": job.chart.name, "version": job.chart.version},
        "TalosVersion": job.talos_version,
        "KubernetesVersion": job.kubernetes_version,
        "Node": job.node.clone().unwrap_or_default(),
        "Offline": job.offline,
        "Template": {"name": template},
    })
}

fn parse_error(template: &str, message: &str) -> EngineError {
    let (location, description) = locate(message, template, &HashMap::new());
    EngineError::Parse {
        location,
        reason: description,
    }
}

/// Pull the template name, line and column out of a handlebars error
/// message. Partial names are mapped back to their file paths.
fn locate(message: &str, fallback: &str, partials: &HashMap<String, String>) -> (Location, String) {
    let file_of = |name: &str| partials.get(name).cloned().unwrap_or_else(|| name.to_string());

    let rendering = Regex::new(r#"(?s)^Error rendering "([^"]*)" line (\d+), col (\d+): (.*)$"#);
    if let Some(caps) = rendering.ok().and_then(|re| re.captures(message)) {
        let location = Location {
            template: file_of(&caps[1]),
            line: caps[2].parse().ok(),
            column: caps[3].parse().ok(),
        };
        return (location, caps[4].trim().to_string());
    }

    let mut location = Location::new(file_of(fallback));
    let position = Regex::new(r"line (\d+), col (\d+)|:(\d+):(\d+)");
    if let Some(caps) = position.ok().and_then(|re| re.captures(message)) {
        let group = |a: usize, b: usize| caps.get(a).or_else(|| caps.get(b));
        location.line = group(1, 3).and_then(|m| m.as_str().parse().ok());
        location.column = group(2, 4).and_then(|m| m.as_str().parse().ok());
    }
    let description = message.lines().next().unwrap_or(message).trim().to_string();
    (location, description)
}

/// Turn the first recorded helper failure (if any) into a typed error.
fn classify_failure(failure: Option<Failure>, location: Location, description: String) -> EngineError {
    match failure {
        Some(Failure::TooComplex(reason)) => EngineError::TooComplex { location, reason },
        Some(Failure::Discovery {
            fact,
            source: DiscoveryError::OfflineFactRequired { .. },
        }) => EngineError::OfflineFactRequired { location, fact },
        Some(Failure::Discovery { fact, source }) => EngineError::Discovery {
            location,
            fact,
            source,
        },
        Some(Failure::SecretPathMissing(path)) => EngineError::SecretPathMissing { location, path },
        Some(Failure::SecretsMissing(path)) => EngineError::SecretsMissing { location, path },
        Some(Failure::Eval { message, path }) => EngineError::Eval {
            location,
            message,
            path,
        },
        None => EngineError::Eval {
            location,
            message: description,
            path: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{BlockingFacts, DiscoveryClient, OfflineNodeApi, UnboundFacts};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use tokio_util::sync::CancellationToken;

    fn chart(entries: &[(&str, &str)]) -> Arc<Chart> {
        let mut files: BTreeMap<String, String> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        files.insert("Chart.yaml".into(), "name: demo\nversion: 0.1.0\n".into());
        Arc::new(Chart::from_files(files).unwrap())
    }

    fn job(chart: Arc<Chart>, template: &str) -> RenderJob {
        RenderJob {
            values: chart.values.clone(),
            chart,
            template: template.to_string(),
            node: None,
            offline: false,
            talos_version: "v1.9.0".into(),
            kubernetes_version: "v1.31.2".into(),
            facts: Arc::new(UnboundFacts),
            secrets: None,
            now: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_render_with_partial_and_context() {
        let chart = chart(&[
            ("values.yaml", "clusterName: demo\n"),
            ("templates/_header.tpl", "# {{Chart.name}} {{Chart.version}}"),
            (
                "templates/worker.yaml",
                "{{> header}}\ncluster: {{Values.clusterName}}\ntalos: {{TalosVersion}}\ntemplate: {{Template.name}}\n",
            ),
        ]);
        let out = Engine::new().render(&job(chart, "./templates/worker.yaml")).unwrap();
        assert_eq!(
            out,
            "# demo 0.1.0\ncluster: demo\ntalos: v1.9.0\ntemplate: templates/worker.yaml\n"
        );
    }

    #[test]
    fn test_missing_template() {
        let chart = chart(&[]);
        let err = Engine::new().render(&job(chart, "templates/nope.yaml")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_parse_error_names_file() {
        let chart = chart(&[("templates/bad.yaml", "a: {{#if x}}\n")]);
        let err = Engine::new().render(&job(chart, "templates/bad.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateParse);
        match err {
            EngineError::Parse { location, .. } => assert_eq!(location.template, "templates/bad.yaml"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_parse_error_in_partial_names_partial_file() {
        let chart = chart(&[
            ("templates/_broken.tpl", "{{#each}}"),
            ("templates/worker.yaml", "x: 1\n"),
        ]);
        match Engine::new().render(&job(chart, "templates/worker.yaml")).unwrap_err() {
            EngineError::Parse { location, .. } => assert_eq!(location.template, "templates/_broken.tpl"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_eval_error_location() {
        let chart = chart(&[(
            "templates/worker.yaml",
            "a: 1\nb: {{required \"endpoint is required\" Values.endpoint}}\n",
        )]);
        let err = Engine::new().render(&job(chart, "templates/worker.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateEval);
        match err {
            EngineError::Eval {
                location,
                message,
                path,
            } => {
                assert_eq!(location.template, "templates/worker.yaml");
                assert_eq!(location.line, Some(2));
                assert_eq!(message, "endpoint is required");
                assert_eq!(path.as_deref(), Some("Values.endpoint"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let chart = chart(&[(
            "templates/loop.yaml",
            "{{#each Values.items}}{{upper this}}{{/each}}",
        )]);
        let mut j = job(chart, "templates/loop.yaml");
        j.values = json!({"items": (0..100).map(|i| i.to_string()).collect::<Vec<_>>()});
        let err = Engine::new().with_max_steps(50).render(&j).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateTooComplex);
    }

    #[test]
    fn test_output_cap() {
        let chart = chart(&[("templates/big.yaml", "{{Values.blob}}")]);
        let mut j = job(chart, "templates/big.yaml");
        j.values = json!({"blob": "x".repeat(2048)});
        let err = Engine::new().with_max_output(1024).render(&j).unwrap_err();
        assert!(matches!(err, EngineError::TooComplex { .. }));
    }

    #[test]
    fn test_unbound_facts_are_unavailable() {
        let chart = chart(&[("templates/w.yaml", "{{discovered \"hostname\"}}")]);
        let err = Engine::new().render(&job(chart, "templates/w.yaml")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DiscoveryUnavailable);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_offline_fact_required() {
        let chart = chart(&[("templates/w.yaml", "host: {{discovered \"hostname\"}}\n")]);
        let client = Arc::new(DiscoveryClient::new(
            "10.0.0.2",
            Arc::new(OfflineNodeApi),
            CancellationToken::new(),
        ));
        let mut j = job(chart, "templates/w.yaml");
        j.offline = true;
        j.facts = Arc::new(BlockingFacts::new(client, tokio::runtime::Handle::current()));

        let err = tokio::task::spawn_blocking(move || Engine::new().render(&j))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OfflineFactRequired);
        match err {
            EngineError::OfflineFactRequired { fact, location } => {
                assert_eq!(fact, "hostname");
                assert_eq!(location.template, "templates/w.yaml");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_locate_rendering_message() {
        let mut partials = HashMap::new();
        partials.insert("config".to_string(), "templates/_config.tpl".to_string());
        let (location, description) = locate(
            "Error rendering \"config\" line 3, col 7: boom",
            "templates/worker.yaml",
            &partials,
        );
        assert_eq!(location.template, "templates/_config.tpl");
        assert_eq!(location.line, Some(3));
        assert_eq!(location.column, Some(7));
        assert_eq!(description, "boom");
        assert_eq!(location.to_string(), "templates/_config.tpl:3:7");
    }
}
