//! Built-in chart presets
//!
//! Every preset is compiled into the binary. `Chart.yaml` files carry the
//! `{cluster_name}` and `{chart_version}` holes filled in by [`materialize`].
//! The shared `talm` library chart is placed under `charts/talm/` of every
//! materialized preset.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PRESET: &str = "generic";
pub const CHART_VERSION: &str = "0.1.0";
pub const LIBRARY_DIR: &str = "charts/talm";

/// One embedded file, by path relative to the chart root.
#[derive(Debug, Clone, Copy)]
pub struct PresetFile {
    pub path: &'static str,
    pub contents: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub files: &'static [PresetFile],
}

macro_rules! preset_file {
    ($dir:literal, $path:literal) => {
        PresetFile {
            path: $path,
            contents: include_str!(concat!("../../presets/", $dir, "/", $path)),
        }
    };
}

static GENERIC: &[PresetFile] = &[
    preset_file!("generic", "Chart.yaml"),
    preset_file!("generic", "values.yaml"),
    preset_file!("generic", "templates/controlplane.yaml"),
    preset_file!("generic", "templates/worker.yaml"),
];

static COZYSTACK: &[PresetFile] = &[
    preset_file!("cozystack", "Chart.yaml"),
    preset_file!("cozystack", "values.yaml"),
    preset_file!("cozystack", "templates/_config.tpl"),
    preset_file!("cozystack", "templates/controlplane.yaml"),
    preset_file!("cozystack", "templates/worker.yaml"),
];

static LIBRARY: &[PresetFile] = &[
    preset_file!("talm", "Chart.yaml"),
    preset_file!("talm", "templates/_config.tpl"),
    preset_file!("talm", "templates/_secrets.tpl"),
    preset_file!("talm", "templates/_network.tpl"),
    preset_file!("talm", "templates/_cluster.tpl"),
];

static PRESETS: &[Preset] = &[
    Preset {
        name: "generic",
        description: "Plain Talos cluster",
        files: GENERIC,
    },
    Preset {
        name: "cozystack",
        description: "Talos tuned for Cozystack (DRBD, ZFS, OVS, no kube-proxy)",
        files: COZYSTACK,
    },
];

impl Preset {
    /// `endpoint` from the preset's own `values.yaml`.
    pub fn default_endpoint(&self) -> Option<String> {
        let values = self.files.iter().find(|f| f.path == "values.yaml")?;
        let parsed: Value = serde_yaml::from_str(values.contents).ok()?;
        parsed.get("endpoint")?.as_str().map(str::to_string)
    }
}

pub fn all() -> &'static [Preset] {
    PRESETS
}

pub fn names() -> Vec<&'static str> {
    PRESETS.iter().map(|p| p.name).collect()
}

pub fn get(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name == name)
}

/// Files of the shared library chart.
pub fn library() -> &'static [PresetFile] {
    LIBRARY
}

// ============================================================================
// SBIO: Pure functions (no I/O)
// ============================================================================

/// Fill the `Chart.yaml` holes.
pub fn fill_chart_yaml(contents: &str, cluster_name: &str, chart_version: &str) -> String {
    contents
        .replace("{cluster_name}", cluster_name)
        .replace("{chart_version}", chart_version)
}

/// The preset as a file tree rooted at the new project, library included.
pub fn materialize(preset: &Preset, cluster_name: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    for file in preset.files {
        let contents = if file.path == "Chart.yaml" {
            fill_chart_yaml(file.contents, cluster_name, CHART_VERSION)
        } else {
            file.contents.to_string()
        };
        files.insert(file.path.to_string(), contents);
    }
    for file in LIBRARY {
        files.insert(format!("{LIBRARY_DIR}/{}", file.path), file.contents.to_string());
    }
    files
}

/// Operator choices written into a preset's `values.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValuesPatch {
    pub endpoint: Option<String>,
    pub pod_subnets: Option<Vec<String>>,
    pub service_subnets: Option<Vec<String>>,
    pub advertised_subnets: Option<Vec<String>>,
    pub floating_ip: Option<String>,
    pub cluster_domain: Option<String>,
    pub image: Option<String>,
}

impl ValuesPatch {
    /// Apply onto a `values.yaml` document. Keys already present keep their
    /// position.
    pub fn apply(&self, values_yaml: &str) -> Result<String, serde_yaml::Error> {
        let mut values: Value = serde_yaml::from_str(values_yaml)?;
        if !values.is_object() {
            values = Value::Object(Default::default());
        }
        let list = |items: &Vec<String>| Value::Array(items.iter().cloned().map(Value::String).collect());
        let mut set = |key: &str, value: Value| {
            if let Some(map) = values.as_object_mut() {
                map.insert(key.to_string(), value);
            }
        };
        if let Some(endpoint) = &self.endpoint {
            set("endpoint", Value::String(endpoint.clone()));
        }
        if let Some(subnets) = &self.pod_subnets {
            set("podSubnets", list(subnets));
        }
        if let Some(subnets) = &self.service_subnets {
            set("serviceSubnets", list(subnets));
        }
        if let Some(subnets) = &self.advertised_subnets {
            set("advertisedSubnets", list(subnets));
        }
        if let Some(ip) = &self.floating_ip {
            set("floatingIP", Value::String(ip.clone()));
        }
        if let Some(domain) = &self.cluster_domain {
            set("clusterDomain", Value::String(domain.clone()));
        }
        if let Some(image) = &self.image {
            set("image", Value::String(image.clone()));
        }
        serde_yaml::to_string(&values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Chart;

    #[test]
    fn test_registry() {
        assert_eq!(names(), vec!["generic", "cozystack"]);
        assert!(get("generic").is_some());
        assert!(get("nope").is_none());
        assert!(get(DEFAULT_PRESET).is_some());
    }

    #[test]
    fn test_default_endpoint() {
        let generic = get("generic").unwrap();
        assert_eq!(generic.default_endpoint().as_deref(), Some("https://192.168.100.10:6443"));
        for preset in all() {
            assert!(preset.default_endpoint().is_some(), "{}", preset.name);
        }
    }

    #[test]
    fn test_materialize_generic() {
        let files = materialize(get("generic").unwrap(), "demo");
        assert!(files["Chart.yaml"].contains("name: demo"));
        assert!(files["Chart.yaml"].contains("version: 0.1.0"));
        assert!(files.contains_key("templates/controlplane.yaml"));
        assert!(files.contains_key("charts/talm/templates/_config.tpl"));

        let chart = Chart::from_files(files).unwrap();
        assert_eq!(chart.name, "demo");
        assert_eq!(chart.values["podSubnets"][0], "10.244.0.0/16");
        let partials: Vec<String> = chart.partials().into_iter().map(|(name, _)| name).collect();
        assert!(partials.contains(&"talm_config".to_string()));
        assert!(partials.contains(&"talm_network".to_string()));
    }

    #[test]
    fn test_every_preset_is_a_chart() {
        for preset in all() {
            let chart = Chart::from_files(materialize(preset, "x")).unwrap();
            assert!(chart.has_template("templates/controlplane.yaml"), "{}", preset.name);
            assert!(chart.has_template("templates/worker.yaml"), "{}", preset.name);
        }
    }

    #[test]
    fn test_values_patch() {
        let patch = ValuesPatch {
            endpoint: Some("https://192.168.0.1:6443".into()),
            floating_ip: Some("192.168.0.1".into()),
            ..Default::default()
        };
        let out = patch.apply(GENERIC[1].contents).unwrap();
        let values: Value = serde_yaml::from_str(&out).unwrap();
        assert_eq!(values["endpoint"], "https://192.168.0.1:6443");
        assert_eq!(values["floatingIP"], "192.168.0.1");
        assert_eq!(values["clusterDomain"], "cluster.local");
        assert!(out.starts_with("endpoint:"));
    }
}
