//! Wizard states and the transitions allowed between them

use std::fmt;

use serde::{Deserialize, Serialize};

use super::WizardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WizardState {
    Preset,
    Endpoint,
    Scanning,
    NodeSelect,
    NodeConfig,
    Confirm,
    Generate,
    Done,
    AddNodeScan,
    CozystackScan,
    #[serde(rename = "VIPConfig")]
    VipConfig,
    NetworkConfig,
    NodeDetails,
}

impl WizardState {
    pub const ALL: [WizardState; 13] = [
        Self::Preset,
        Self::Endpoint,
        Self::Scanning,
        Self::NodeSelect,
        Self::NodeConfig,
        Self::Confirm,
        Self::Generate,
        Self::Done,
        Self::AddNodeScan,
        Self::CozystackScan,
        Self::VipConfig,
        Self::NetworkConfig,
        Self::NodeDetails,
    ];

    /// States reachable in one move.
    pub fn successors(self) -> &'static [WizardState] {
        use WizardState::*;
        match self {
            Preset => &[Endpoint, AddNodeScan],
            Endpoint => &[Scanning, NodeSelect],
            Scanning => &[NodeSelect, Endpoint],
            NodeSelect => &[NodeConfig, Endpoint],
            NodeConfig => &[Confirm, NodeSelect],
            Confirm => &[Generate, NodeConfig],
            Generate => &[Done],
            Done => &[],
            AddNodeScan => &[Scanning, NodeSelect],
            CozystackScan => &[NodeSelect],
            VipConfig => &[NetworkConfig],
            NetworkConfig => &[NodeDetails],
            NodeDetails => &[Confirm],
        }
    }

    pub fn can_transition(self, to: WizardState) -> bool {
        self.successors().contains(&to)
    }

    pub fn transition(self, to: WizardState) -> Result<WizardState, WizardError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(WizardError::InvalidTransition { from: self, to })
        }
    }

    /// States a scan may be started from; a failed scan returns there.
    pub fn is_scan_origin(self) -> bool {
        matches!(self, Self::Endpoint | Self::AddNodeScan | Self::CozystackScan)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Preset => "Preset",
            Self::Endpoint => "Endpoint",
            Self::Scanning => "Scanning",
            Self::NodeSelect => "NodeSelect",
            Self::NodeConfig => "NodeConfig",
            Self::Confirm => "Confirm",
            Self::Generate => "Generate",
            Self::Done => "Done",
            Self::AddNodeScan => "AddNodeScan",
            Self::CozystackScan => "CozystackScan",
            Self::VipConfig => "VIPConfig",
            Self::NetworkConfig => "NetworkConfig",
            Self::NodeDetails => "NodeDetails",
        }
    }
}

impl fmt::Display for WizardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
