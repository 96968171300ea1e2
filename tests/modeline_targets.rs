//! Integration tests for modeline-driven re-rendering
//!
//! `talm init --node` writes a node file whose first line records nodes,
//! endpoints and templates. Later invocations with `-f` take their targets
//! from that line unless the command line overrides them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_yaml::Value;
use tempfile::TempDir;

use talm::cli::{plan_renders, GlobalArgs, RenderArgs};
use talm::discovery::StaticNodeApi;
use talm::modeline::{self, Modeline, Targets};
use talm::observe::silent;
use talm::render::Renderer;
use talm::wizard::generate::generate;
use talm::wizard::{InitData, NodeConfig, NodeRole};

fn clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

/// A project with one control-plane node file, `nodes/node1.yaml`.
async fn project_with_node() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let node = NodeConfig::new("10.0.0.2", NodeRole::ControlPlane)
        .with_hostname("cp1")
        .with_install_disk("/dev/vda")
        .with_interface("eth0", vec!["10.0.0.2/24".into()])
        .with_gateway("10.0.0.1");
    let data = InitData::new(dir.path())
        .with_cluster_name("demo")
        .with_node(node)
        .with_now(clock());
    generate(&data, &silent(), None).await.unwrap();
    let file = dir.path().join("nodes/node1.yaml");
    (dir, file)
}

fn render_args(file: &Path) -> RenderArgs {
    RenderArgs {
        files: vec![file.to_path_buf()],
        offline: true,
        talos_version: "v1.9.0".into(),
        kubernetes_version: "v1.31.2".into(),
        ..RenderArgs::default()
    }
}

fn global(root: &Path) -> GlobalArgs {
    GlobalArgs {
        root: root.to_path_buf(),
        ..GlobalArgs::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_node_file_carries_modeline() {
    let (_dir, file) = project_with_node().await;
    let line = modeline::read_from_file(&file).unwrap();
    assert_eq!(
        line,
        Modeline::new(
            vec!["10.0.0.2".into()],
            vec!["10.0.0.2".into()],
            vec!["templates/controlplane.yaml".into()],
        )
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rerender_from_modeline() {
    let (dir, file) = project_with_node().await;
    let plans = plan_renders(&global(dir.path()), &render_args(&file)).unwrap();
    assert_eq!(plans.len(), 1);
    let mut opts = plans[0].opts.clone();
    opts.now = clock();

    let api = Arc::new(StaticNodeApi::new());
    let rendered = Renderer::new(api.clone()).render(&opts).await.unwrap();
    assert_eq!(api.calls(), 0);

    let doc = rendered.get("controlplane.10.0.0.2").unwrap();
    let original = std::fs::read_to_string(&file).unwrap();
    assert_eq!(doc.content.lines().next(), original.lines().next());

    let config: Value = serde_yaml::from_str(&doc.content).unwrap();
    assert_eq!(config["machine"]["network"]["hostname"].as_str(), Some("cp1"));
    assert_eq!(config["machine"]["install"]["disk"].as_str(), Some("/dev/vda"));
    let iface = &config["machine"]["network"]["interfaces"][0];
    assert_eq!(iface["interface"].as_str(), Some("eth0"));
    assert_eq!(iface["routes"][0]["gateway"].as_str(), Some("10.0.0.1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_command_line_targets_win() {
    let (dir, file) = project_with_node().await;
    let global = GlobalArgs {
        nodes: vec!["10.0.0.5".into()],
        ..global(dir.path())
    };
    let plans = plan_renders(&global, &render_args(&file)).unwrap();
    let opts = &plans[0].opts;
    assert_eq!(opts.nodes, vec!["10.0.0.5"]);
    assert_eq!(opts.endpoints, vec!["10.0.0.2"]);

    let rendered = Renderer::new(Arc::new(StaticNodeApi::new())).render(opts).await.unwrap();
    let doc = rendered.get("controlplane.10.0.0.5").unwrap();
    let line = modeline::parse(doc.content.lines().next().unwrap()).unwrap();
    assert_eq!(line.nodes, vec!["10.0.0.5"]);
    assert_eq!(line.endpoints, vec!["10.0.0.2"]);
}

#[test]
fn test_targets_resolution() {
    let line = Modeline::new(vec!["a".into()], vec!["b".into()], vec![]);
    let inherited = Targets::resolve(&[], &[], Some(&line));
    assert_eq!(inherited.nodes, vec!["a"]);
    assert_eq!(inherited.endpoints, vec!["b"]);

    let overridden = Targets::resolve(&["x".into()], &[], Some(&line));
    assert_eq!(overridden.nodes, vec!["x"]);
    assert_eq!(overridden.endpoints, vec!["b"]);

    assert_eq!(Targets::resolve(&[], &[], None), Targets::default());
}
