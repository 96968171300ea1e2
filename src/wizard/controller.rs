//! Intent handling and background jobs

use std::net::IpAddr;
use std::path::PathBuf;

use ipnet::IpNet;
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::error::Classify;
use crate::observe::ObserverHandle;
use crate::presets;
use crate::render::validate::is_https_endpoint;
use crate::scanner::{hosts_of, NodeInfo, Scanner};

use super::data::{InitData, InitMode, NodeConfig, NodeRole};
use super::generate::generate;
use super::{WizardError, WizardEvent, WizardState};

/// What the presenter asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// Start a new project from a preset.
    ChoosePreset { preset: String, cluster_name: String },
    /// Add a node to the project in the root directory.
    AddNodes,
    /// Kubernetes API endpoint, optionally followed by a scan of `scan`.
    SubmitEndpoint { endpoint: String, scan: Option<String> },
    StartScan { cidr: String },
    CancelScan,
    SkipScan,
    ScanFinished(Vec<NodeInfo>),
    ScanFailed { message: String, partial: Vec<NodeInfo> },
    /// `None` generates the project without a node.
    SelectNode { ip: Option<String>, role: NodeRole },
    ConfigureNode(Option<NodeConfig>),
    ConfigureVip { floating_ip: Option<String> },
    ConfigureNetwork {
        pod_subnets: Vec<String>,
        service_subnets: Vec<String>,
        advertised_subnets: Vec<String>,
        cluster_domain: Option<String>,
    },
    SubmitNodeDetails(NodeConfig),
    Confirm { force: bool },
    GenerateFinished(Vec<PathBuf>),
    GenerateFailed { message: String },
    Back,
}

/// Owns the wizard state and the collected data.
#[derive(Debug, Clone)]
pub struct Controller {
    state: WizardState,
    data: InitData,
    scan_origin: WizardState,
    message: Option<String>,
}

impl Controller {
    pub fn new(data: InitData) -> Self {
        Self::starting_at(WizardState::Preset, data)
    }

    /// Enter the table somewhere else, e.g. the Cozystack flow at
    /// `CozystackScan` or cluster network setup at `VIPConfig`.
    pub fn starting_at(state: WizardState, data: InitData) -> Self {
        Self {
            state,
            data,
            scan_origin: if state.is_scan_origin() { state } else { WizardState::Endpoint },
            message: None,
        }
    }

    pub fn state(&self) -> WizardState {
        self.state
    }

    pub fn data(&self) -> &InitData {
        &self.data
    }

    pub fn into_data(self) -> InitData {
        self.data
    }

    /// Message for the user after a failed scan or generate.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Apply `intent`. On error neither the state nor the data change.
    pub fn handle(&mut self, intent: Intent) -> Result<WizardState, WizardError> {
        trace!(state = %self.state, ?intent, "intent");
        match intent {
            Intent::ScanFailed { message, partial } => self.recover_scan(message, partial),
            Intent::GenerateFailed { message } => self.recover_generate(message),
            intent => {
                let to = self.state.transition(self.target(&intent))?;
                let mut data = self.data.clone();
                let scan_origin = self.apply(&mut data, intent)?;
                debug!(from = %self.state, %to, "transition");
                self.data = data;
                if let Some(origin) = scan_origin {
                    self.scan_origin = origin;
                }
                self.state = to;
                self.message = None;
                Ok(to)
            }
        }
    }

    /// Feed a background event. Progress events leave the state alone.
    pub fn on_event(&mut self, event: WizardEvent) -> Result<WizardState, WizardError> {
        match event.into_intent() {
            Some(intent) => self.handle(intent),
            None => Ok(self.state),
        }
    }

    fn target(&self, intent: &Intent) -> WizardState {
        use WizardState::*;
        match intent {
            Intent::ChoosePreset { .. } => Endpoint,
            Intent::AddNodes => AddNodeScan,
            Intent::SubmitEndpoint { scan: Some(_), .. } | Intent::StartScan { .. } => Scanning,
            Intent::SubmitEndpoint { scan: None, .. } => NodeSelect,
            Intent::CancelScan => Endpoint,
            Intent::SkipScan | Intent::ScanFinished(_) => NodeSelect,
            Intent::SelectNode { .. } => NodeConfig,
            Intent::ConfigureNode(_) | Intent::SubmitNodeDetails(_) => Confirm,
            Intent::ConfigureVip { .. } => NetworkConfig,
            Intent::ConfigureNetwork { .. } => NodeDetails,
            Intent::Confirm { .. } => Generate,
            Intent::GenerateFinished(_) => Done,
            Intent::Back => match self.state {
                Scanning | NodeSelect => Endpoint,
                NodeConfig => NodeSelect,
                Confirm => NodeConfig,
                other => other,
            },
            Intent::ScanFailed { .. } => self.scan_origin,
            Intent::GenerateFailed { .. } => Confirm,
        }
    }

    /// Update `data` for an allowed intent. Returns the new scan origin when
    /// the intent starts a scan.
    fn apply(&self, data: &mut InitData, intent: Intent) -> Result<Option<WizardState>, WizardError> {
        match intent {
            Intent::ChoosePreset { preset, cluster_name } => {
                if presets::get(&preset).is_none() {
                    return Err(WizardError::Validation(format!(
                        "unknown preset '{preset}', expected one of {}",
                        presets::names().join(", ")
                    )));
                }
                check_cluster_name(&cluster_name)?;
                data.mode = InitMode::NewCluster;
                data.preset = preset;
                data.cluster_name = cluster_name;
            }
            Intent::AddNodes => data.mode = InitMode::AddNode,
            Intent::SubmitEndpoint { endpoint, scan } => {
                if !is_https_endpoint(&endpoint) {
                    return Err(WizardError::Validation(format!(
                        "API endpoint must be an https://host:port URL, got '{endpoint}'"
                    )));
                }
                data.values.endpoint = Some(endpoint);
                if let Some(cidr) = scan {
                    hosts_of(&cidr)?;
                    data.scan_cidr = Some(cidr);
                    return Ok(Some(self.state));
                }
            }
            Intent::StartScan { cidr } => {
                hosts_of(&cidr)?;
                data.scan_cidr = Some(cidr);
                return Ok(Some(self.state));
            }
            Intent::ScanFinished(nodes) => data.discovered = nodes,
            Intent::SelectNode { ip: None, .. } => data.node = None,
            Intent::SelectNode { ip: Some(ip), role } => {
                let addr: IpAddr = ip
                    .parse()
                    .map_err(|_| WizardError::Validation(format!("'{ip}' is not an IP address")))?;
                data.node = Some(match data.discovered.iter().find(|n| n.ip == addr) {
                    Some(found) => NodeConfig::from_node(found, role),
                    None => NodeConfig::new(ip, role),
                });
            }
            Intent::ConfigureNode(node) => {
                if let Some(node) = &node {
                    node.validate()?;
                }
                data.node = node;
            }
            Intent::SubmitNodeDetails(node) => {
                node.validate()?;
                data.node = Some(node);
            }
            Intent::ConfigureVip { floating_ip } => {
                if let Some(ip) = &floating_ip {
                    ip.parse::<IpAddr>().map_err(|_| {
                        WizardError::Validation(format!("floating IP '{ip}' is not an IP address"))
                    })?;
                }
                data.values.floating_ip = floating_ip;
            }
            Intent::ConfigureNetwork {
                pod_subnets,
                service_subnets,
                advertised_subnets,
                cluster_domain,
            } => {
                for (field, subnets, target) in [
                    ("pod subnets", pod_subnets, &mut data.values.pod_subnets),
                    ("service subnets", service_subnets, &mut data.values.service_subnets),
                    ("advertised subnets", advertised_subnets, &mut data.values.advertised_subnets),
                ] {
                    if let Some(bad) = subnets.iter().find(|s| s.parse::<IpNet>().is_err()) {
                        return Err(WizardError::Validation(format!("{field}: '{bad}' is not a CIDR")));
                    }
                    if !subnets.is_empty() {
                        *target = Some(subnets);
                    }
                }
                if let Some(domain) = cluster_domain.filter(|d| !d.is_empty()) {
                    data.values.cluster_domain = Some(domain);
                }
            }
            Intent::Confirm { force } => {
                if data.mode == InitMode::AddNode && data.node.is_none() {
                    return Err(WizardError::Validation("adding a node needs a selected node".to_string()));
                }
                data.force = force;
            }
            Intent::CancelScan
            | Intent::SkipScan
            | Intent::GenerateFinished(_)
            | Intent::Back
            | Intent::ScanFailed { .. }
            | Intent::GenerateFailed { .. } => {}
        }
        Ok(None)
    }

    fn recover_scan(&mut self, message: String, partial: Vec<NodeInfo>) -> Result<WizardState, WizardError> {
        if !matches!(self.state, WizardState::Scanning | WizardState::CozystackScan) {
            return Err(WizardError::InvalidTransition {
                from: self.state,
                to: self.scan_origin,
            });
        }
        warn!(%message, origin = %self.scan_origin, "scan failed");
        if !partial.is_empty() {
            self.data.discovered = partial;
        }
        self.state = self.scan_origin;
        self.message = Some(message);
        Ok(self.state)
    }

    fn recover_generate(&mut self, message: String) -> Result<WizardState, WizardError> {
        if self.state != WizardState::Generate {
            return Err(WizardError::InvalidTransition {
                from: self.state,
                to: WizardState::Confirm,
            });
        }
        warn!(%message, "generate failed");
        self.state = WizardState::Confirm;
        self.message = Some(message);
        Ok(self.state)
    }
}

/// Lowercase DNS label, or empty to use the directory name.
fn check_cluster_name(name: &str) -> Result<(), WizardError> {
    if name.is_empty() {
        return Ok(());
    }
    let valid = Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$")
        .map(|pattern| pattern.is_match(name))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(WizardError::Validation(format!(
            "cluster name '{name}' must be a lowercase DNS label"
        )))
    }
}

// ============================================================================
// Background jobs
// ============================================================================

async fn deliver(events: &mpsc::Sender<WizardEvent>, event: WizardEvent) {
    if events.send(event).await.is_err() {
        debug!("wizard presenter went away before the result arrived");
    }
}

/// Scan `cidr`, forwarding progress and finishing with a terminal event.
pub async fn run_scan(scanner: &Scanner, cidr: &str, events: &mpsc::Sender<WizardEvent>) {
    let (tx, mut rx) = mpsc::channel::<u8>(16);
    let forward = {
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(percent) = rx.recv().await {
                let _ = events.try_send(WizardEvent::ScanProgress(percent));
            }
        })
    };
    let outcome = scanner.scan(cidr, Some(&tx)).await;
    drop(tx);
    let _ = forward.await;

    let event = match outcome {
        Ok(nodes) => {
            info!(found = nodes.len(), "scan complete");
            WizardEvent::ScanFinished(nodes)
        }
        Err(e) => WizardEvent::ScanFailed {
            message: e.to_string(),
            kind: e.kind(),
            partial: e.partial().to_vec(),
        },
    };
    deliver(events, event).await;
}

/// Run the Generate step, finishing with a terminal event.
pub async fn run_generate(data: &InitData, observer: &ObserverHandle, events: &mpsc::Sender<WizardEvent>) {
    let event = match generate(data, observer, Some(events)).await {
        Ok(files) => WizardEvent::GenerateFinished(files),
        Err(e) => {
            observer.finished("init", false);
            WizardEvent::GenerateFailed {
                message: e.to_string(),
                kind: e.kind(),
            }
        }
    };
    deliver(events, event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ResourceItem, ResourceKind, StaticNodeApi};
    use crate::error::ErrorKind;
    use crate::observe::silent;
    use crate::scanner::Prober;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn controller() -> Controller {
        Controller::new(InitData::new("/tmp/unused"))
    }

    fn choose(c: &mut Controller) {
        c.handle(Intent::ChoosePreset {
            preset: "generic".into(),
            cluster_name: "demo".into(),
        })
        .unwrap();
    }

    struct OneHost(IpAddr);

    #[async_trait]
    impl Prober for OneHost {
        async fn probe(&self, ip: IpAddr, _deadline: Duration) -> bool {
            ip == self.0
        }
    }

    #[test]
    fn test_invalid_transition_leaves_state_alone() {
        let mut c = controller();
        let before = c.data().clone();
        let err = c.handle(Intent::Confirm { force: true }).unwrap_err();
        assert!(matches!(
            err,
            WizardError::InvalidTransition {
                from: WizardState::Preset,
                to: WizardState::Generate
            }
        ));
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(c.state(), WizardState::Preset);
        assert_eq!(c.data(), &before);
    }

    #[test]
    fn test_validation_leaves_state_alone() {
        let mut c = controller();
        choose(&mut c);
        let err = c
            .handle(Intent::SubmitEndpoint {
                endpoint: "http://10.0.0.1".into(),
                scan: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(c.state(), WizardState::Endpoint);
        assert!(c.data().values.endpoint.is_none());

        let err = c
            .handle(Intent::SubmitEndpoint {
                endpoint: "https://10.0.0.1:6443".into(),
                scan: Some("10.0.0.0/8".into()),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(c.data().values.endpoint.is_none());

        assert!(controller()
            .handle(Intent::ChoosePreset { preset: "nope".into(), cluster_name: String::new() })
            .is_err());
        assert!(controller()
            .handle(Intent::ChoosePreset { preset: "generic".into(), cluster_name: "Bad_Name".into() })
            .is_err());
    }

    #[test]
    fn test_happy_path_to_generate() {
        let mut c = controller();
        choose(&mut c);
        assert_eq!(
            c.handle(Intent::SubmitEndpoint {
                endpoint: "https://10.0.0.10:6443".into(),
                scan: None
            })
            .unwrap(),
            WizardState::NodeSelect
        );
        c.handle(Intent::SelectNode {
            ip: Some("10.0.0.2".into()),
            role: NodeRole::ControlPlane,
        })
        .unwrap();
        assert_eq!(c.data().node.as_ref().unwrap().ip, "10.0.0.2");
        assert_eq!(c.handle(Intent::Back).unwrap(), WizardState::NodeSelect);
        c.handle(Intent::SelectNode { ip: None, role: NodeRole::Worker }).unwrap();
        c.handle(Intent::ConfigureNode(None)).unwrap();
        assert_eq!(c.handle(Intent::Confirm { force: false }).unwrap(), WizardState::Generate);
        assert_eq!(
            c.handle(Intent::GenerateFinished(vec![])).unwrap(),
            WizardState::Done
        );
        assert!(c.handle(Intent::Back).is_err());
    }

    #[test]
    fn test_scan_failure_returns_to_origin() {
        let mut c = controller();
        c.handle(Intent::AddNodes).unwrap();
        c.handle(Intent::StartScan { cidr: "10.0.0.0/24".into() }).unwrap();
        assert_eq!(c.state(), WizardState::Scanning);

        let state = c
            .handle(Intent::ScanFailed {
                message: "scan timed out".into(),
                partial: vec![],
            })
            .unwrap();
        assert_eq!(state, WizardState::AddNodeScan);
        assert_eq!(c.message(), Some("scan timed out"));

        c.handle(Intent::StartScan { cidr: "10.0.0.0/24".into() }).unwrap();
        assert_eq!(c.handle(Intent::CancelScan).unwrap(), WizardState::Endpoint);
        assert!(c.message().is_none());
    }

    #[test]
    fn test_generate_failure_returns_to_confirm() {
        let mut c = controller();
        assert!(c.handle(Intent::GenerateFailed { message: "x".into() }).is_err());
        choose(&mut c);
        c.handle(Intent::SubmitEndpoint { endpoint: "https://10.0.0.10:6443".into(), scan: None })
            .unwrap();
        c.handle(Intent::SelectNode { ip: None, role: NodeRole::Worker }).unwrap();
        c.handle(Intent::ConfigureNode(None)).unwrap();
        c.handle(Intent::Confirm { force: false }).unwrap();
        let state = c
            .on_event(WizardEvent::GenerateFailed {
                message: "disk full".into(),
                kind: ErrorKind::Filesystem,
            })
            .unwrap();
        assert_eq!(state, WizardState::Confirm);
        assert_eq!(c.message(), Some("disk full"));
    }

    #[test]
    fn test_cozystack_flow() {
        let mut c = Controller::starting_at(WizardState::CozystackScan, InitData::new("/tmp/unused"));
        assert_eq!(c.handle(Intent::SkipScan).unwrap(), WizardState::NodeSelect);

        let mut c = Controller::starting_at(WizardState::VipConfig, InitData::new("/tmp/unused"));
        c.handle(Intent::ConfigureVip { floating_ip: Some("10.0.0.10".into()) }).unwrap();
        c.handle(Intent::ConfigureNetwork {
            pod_subnets: vec!["10.244.0.0/16".into()],
            service_subnets: vec![],
            advertised_subnets: vec!["10.0.0.0/24".into()],
            cluster_domain: Some("cozy.local".into()),
        })
        .unwrap();
        let node = NodeConfig::new("10.0.0.2", NodeRole::ControlPlane)
            .with_hostname("cp1")
            .with_install_disk("/dev/sda")
            .with_interface("eth0", vec!["10.0.0.2/24".into()]);
        assert_eq!(c.handle(Intent::SubmitNodeDetails(node)).unwrap(), WizardState::Confirm);
        let values = &c.data().values;
        assert_eq!(values.floating_ip.as_deref(), Some("10.0.0.10"));
        assert_eq!(values.cluster_domain.as_deref(), Some("cozy.local"));
        assert!(values.service_subnets.is_none());
    }

    #[tokio::test]
    async fn test_run_scan_feeds_controller() {
        let node = "10.0.0.2";
        let gib = 1024u64 * 1024 * 1024;
        let api = StaticNodeApi::new()
            .with_resource(node, ResourceKind::Hostname, vec![ResourceItem::new("hostname", json!({"hostname": "alpha"}))])
            .with_resource(node, ResourceKind::Disks, vec![ResourceItem::new("sda", json!({"dev_path": "/dev/sda", "size": 20 * gib}))])
            .with_resource(node, ResourceKind::Links, vec![ResourceItem::new("eth0", json!({"hardwareAddr": "52:54:00:00:00:01"}))])
            .with_resource(node, ResourceKind::Addresses, vec![ResourceItem::new("a", json!({"address": "10.0.0.2/24", "linkName": "eth0"}))])
            .with_resource(node, ResourceKind::Routes, vec![ResourceItem::new("r", json!({"family": "inet4", "dst": "", "gateway": "10.0.0.1", "outLinkName": "eth0", "priority": 1024}))]);
        let scanner = Scanner::new(Arc::new(api)).with_prober(Arc::new(OneHost(node.parse().unwrap())));

        let mut c = controller();
        choose(&mut c);
        c.handle(Intent::SubmitEndpoint {
            endpoint: "https://10.0.0.10:6443".into(),
            scan: Some("10.0.0.0/29".into()),
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        run_scan(&scanner, c.data().scan_cidr.as_deref().unwrap(), &tx).await;
        drop(tx);
        while let Some(event) = rx.recv().await {
            c.on_event(event).unwrap();
        }
        assert_eq!(c.state(), WizardState::NodeSelect);
        assert_eq!(c.data().discovered.len(), 1);

        c.handle(Intent::SelectNode { ip: Some(node.into()), role: NodeRole::ControlPlane })
            .unwrap();
        let selected = c.data().node.clone().unwrap();
        assert_eq!(selected.hostname, "alpha");
        assert_eq!(selected.install_disk, "/dev/sda");
        assert_eq!(selected.gateway.as_deref(), Some("10.0.0.1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_generate_reports_terminal_event() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("secrets.yaml"), "keep\n").unwrap();
        let data = InitData::new(dir.path()).with_cluster_name("demo");
        let (tx, mut rx) = mpsc::channel(64);
        run_generate(&data, &silent(), &tx).await;
        drop(tx);

        let mut terminal = None;
        while let Some(event) = rx.recv().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        match terminal {
            Some(WizardEvent::GenerateFailed { kind, message }) => {
                assert_eq!(kind, ErrorKind::FilesystemExists);
                assert!(message.contains("secrets.yaml"));
            }
            other => panic!("unexpected terminal event {other:?}"),
        }
    }
}
