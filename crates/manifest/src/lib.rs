//! Extension manifest: YAML parsing with size guards, deployment descriptors
//! and the desired-vs-deployed plan the extension reconciler executes.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod puller;

pub use puller::{resolve, Artifact, ArtifactPuller, LocalPuller, ManifestSource, OciPuller};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest too large ({0} bytes, limit {1})")]
    TooLarge(usize, usize),
    #[error("manifest too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("parsing manifest: {0}")]
    Parse(String),
    #[error("invalid manifest: {0}")]
    Invalid(String),
    #[error("reading manifest: {0}")]
    Io(#[from] std::io::Error),
}

fn max_manifest_bytes() -> usize {
    std::env::var("TENANT_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_manifest_nodes() -> usize {
    std::env::var("TENANT_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Present,
    Absent,
}

/// Identity of a deployment on the deployment manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeploymentKey {
    pub app_name: String,
    pub version: String,
    pub profile_name: String,
}

/// One desired extension deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    pub app_name: String,
    pub display_name: String,
    pub version: String,
    pub profile_name: String,
    pub target_cluster_labels: BTreeMap<String, String>,
    pub desired_state: DesiredState,
}

impl DeploymentDescriptor {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey { app_name: self.app_name.clone(), version: self.version.clone(), profile_name: self.profile_name.clone() }
    }
}

/// A deployment package whose YAML files get uploaded to the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentPackage {
    pub dpkg: String,
    pub version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestMetadata {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub release: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub metadata: ManifestMetadata,
    pub packages: Vec<DeploymentPackage>,
    pub deployments: Vec<DeploymentDescriptor>,
}

// ---- wire shape ----

#[derive(Deserialize)]
struct RawManifest {
    #[serde(default)]
    metadata: ManifestMetadata,
    lpke: Option<RawLpke>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RawLpke {
    #[serde(default)]
    deployment_packages: Vec<DeploymentPackage>,
    #[serde(default)]
    deployment_list: Vec<RawDeployment>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDeployment {
    #[serde(default)]
    dp_name: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    dp_version: String,
    #[serde(default)]
    dp_profile_name: String,
    #[serde(default)]
    all_app_target_clusters: Vec<RawLabel>,
    desired_state: Option<String>,
}

#[derive(Deserialize)]
struct RawLabel {
    key: String,
    val: String,
}

impl RawDeployment {
    fn into_descriptor(self, idx: usize) -> Result<DeploymentDescriptor, ManifestError> {
        for (field, v) in [("dpName", &self.dp_name), ("dpVersion", &self.dp_version), ("dpProfileName", &self.dp_profile_name)] {
            if v.trim().is_empty() {
                return Err(ManifestError::Invalid(format!("deploymentList[{}] missing {}", idx, field)));
            }
        }
        let desired_state = match self.desired_state.as_deref().map(str::trim) {
            None | Some("") | Some("present") => DesiredState::Present,
            Some("absent") => DesiredState::Absent,
            Some(other) => {
                return Err(ManifestError::Invalid(format!("deploymentList[{}] unknown desiredState {:?}", idx, other)))
            }
        };
        let display_name = if self.display_name.is_empty() { self.dp_name.clone() } else { self.display_name };
        let target_cluster_labels = self.all_app_target_clusters.into_iter().map(|l| (l.key, l.val)).collect();
        Ok(DeploymentDescriptor {
            app_name: self.dp_name,
            display_name,
            version: self.dp_version,
            profile_name: self.dp_profile_name,
            target_cluster_labels,
            desired_state,
        })
    }
}

/// Parse a manifest document, enforcing the byte and node budgets first.
pub fn parse(yaml: &str) -> Result<Manifest, ManifestError> {
    let max_bytes = max_manifest_bytes();
    if yaml.len() > max_bytes {
        return Err(ManifestError::TooLarge(yaml.len(), max_bytes));
    }
    let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse(e.to_string()))?;
    let json = serde_json::to_value(val).map_err(|e| ManifestError::Parse(e.to_string()))?;
    let max_nodes = max_manifest_nodes();
    if json_node_budget_exceeded(&json, max_nodes) {
        return Err(ManifestError::TooComplex(max_nodes));
    }
    let raw: RawManifest = serde_json::from_value(json).map_err(|e| ManifestError::Parse(e.to_string()))?;
    let lpke = raw.lpke.ok_or_else(|| ManifestError::Invalid("missing lpke section".into()))?;
    let deployments = lpke
        .deployment_list
        .into_iter()
        .enumerate()
        .map(|(i, d)| d.into_descriptor(i))
        .collect::<Result<Vec<_>, _>>()?;
    let mut seen = HashSet::new();
    for d in &deployments {
        if !seen.insert(d.key()) {
            return Err(ManifestError::Invalid(format!(
                "duplicate deployment {}/{}/{}",
                d.app_name, d.version, d.profile_name
            )));
        }
    }
    Ok(Manifest { metadata: raw.metadata, packages: lpke.deployment_packages, deployments })
}

// ---- planning ----

/// A deployment currently known to the deployment manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeployedApp {
    pub id: String,
    pub app_name: String,
    pub version: String,
    pub profile_name: String,
}

impl DeployedApp {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey { app_name: self.app_name.clone(), version: self.version.clone(), profile_name: self.profile_name.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDelete {
    pub descriptor: DeploymentDescriptor,
    pub deployment_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub create: Vec<DeploymentDescriptor>,
    pub delete: Vec<PlannedDelete>,
    pub unchanged: usize,
}

impl Plan {
    pub fn is_noop(&self) -> bool { self.create.is_empty() && self.delete.is_empty() }
}

/// Diff manifest entries against what is deployed, keyed by (app, version, profile).
/// Deployments the manifest does not mention are left alone.
pub fn plan(desired: &[DeploymentDescriptor], deployed: &[DeployedApp]) -> Plan {
    let mut out = Plan::default();
    for d in desired {
        let key = d.key();
        let matches: Vec<&DeployedApp> = deployed.iter().filter(|x| x.key() == key).collect();
        match (d.desired_state, matches.is_empty()) {
            (DesiredState::Present, true) => out.create.push(d.clone()),
            (DesiredState::Absent, false) => {
                for m in matches {
                    out.delete.push(PlannedDelete { descriptor: d.clone(), deployment_id: m.id.clone() });
                }
            }
            _ => out.unchanged += 1,
        }
    }
    out
}
