//! Cluster configuration (`.infra/cluster.toml`) and its marshalling into the
//! variable map handed to the backend.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Description of the cluster whose infrastructure is managed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    /// Cluster name; also scopes the state cache.
    pub name: String,
    /// Cloud provider, selects the layouts subtree.
    pub provider: String,
    /// Layout within the provider.
    pub layout: String,
    /// Free-form provider variables passed to the backend verbatim.
    #[serde(default)]
    pub variables: toml::Table,
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        crate::core::slot::validate_slot(&self.name)
            .map_err(|err| anyhow!("invalid cluster name: {err}"))?;
        if self.provider.trim().is_empty() {
            return Err(anyhow!("provider must not be empty"));
        }
        if self.layout.trim().is_empty() {
            return Err(anyhow!("layout must not be empty"));
        }
        Ok(())
    }

    /// Variables for the backend: the user table plus `clusterName`,
    /// `provider` and `layout` (user values win on collision).
    pub fn marshal_variables(&self) -> Result<BTreeMap<String, Value>> {
        let mut vars = BTreeMap::new();
        for (key, value) in &self.variables {
            let json = serde_json::to_value(value)
                .with_context(|| format!("convert variable '{key}' to json"))?;
            vars.insert(key.clone(), json);
        }
        vars.entry("clusterName".to_string())
            .or_insert_with(|| Value::String(self.name.clone()));
        vars.entry("provider".to_string())
            .or_insert_with(|| Value::String(self.provider.clone()));
        vars.entry("layout".to_string())
            .or_insert_with(|| Value::String(self.layout.clone()));
        Ok(vars)
    }

    /// Backend module directory for a slot.
    pub fn step_dir(&self, layouts_root: &Path, slot: &str) -> PathBuf {
        layouts_root
            .join(self.provider.to_lowercase())
            .join("layouts")
            .join(self.layout.to_lowercase().replace('-', "_"))
            .join(slot)
    }
}

pub fn load_cluster_config(path: &Path) -> Result<ClusterConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ClusterConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate().with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLUSTER_TOML: &str = r#"
name = "sandbox-21"
provider = "OpenStack"
layout = "Standard-With-NAT"

[variables]
masterNodeGroup = { replicas = 1, instanceClass = { flavorName = "m1.large" } }
sshPublicKey = "ssh-rsa AAAA"
"#;

    #[test]
    fn loads_and_marshals_variables() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cluster.toml");
        fs::write(&path, CLUSTER_TOML).expect("write");
        let cfg = load_cluster_config(&path).expect("load");
        let vars = cfg.marshal_variables().expect("marshal");
        assert_eq!(vars["clusterName"], Value::String("sandbox-21".into()));
        assert_eq!(vars["provider"], Value::String("OpenStack".into()));
        assert_eq!(vars["masterNodeGroup"]["replicas"], Value::from(1));
        assert_eq!(
            vars["masterNodeGroup"]["instanceClass"]["flavorName"],
            Value::String("m1.large".into())
        );
    }

    #[test]
    fn user_variables_win_over_injected_ones() {
        let mut cfg: ClusterConfig = toml::from_str(CLUSTER_TOML).expect("parse");
        cfg.variables
            .insert("clusterName".into(), toml::Value::String("override".into()));
        let vars = cfg.marshal_variables().expect("marshal");
        assert_eq!(vars["clusterName"], Value::String("override".into()));
    }

    #[test]
    fn step_dir_follows_layout_convention() {
        let cfg: ClusterConfig = toml::from_str(CLUSTER_TOML).expect("parse");
        let dir = cfg.step_dir(Path::new("/layouts"), "base-infrastructure");
        assert_eq!(
            dir,
            PathBuf::from("/layouts/openstack/layouts/standard_with_nat/base-infrastructure")
        );
    }

    #[test]
    fn rejects_empty_provider() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("cluster.toml");
        fs::write(&path, "name = \"c\"\nprovider = \"\"\nlayout = \"x\"\n").expect("write");
        assert!(load_cluster_config(&path).is_err());
    }
}
