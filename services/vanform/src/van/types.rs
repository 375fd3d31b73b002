//! VAN Topology Types
//!
//! Zone definitions, the reachability predicate and the per-instance
//! configuration decoded from the `skupper-van-form` config object.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

use crate::error::{Result, VanFormError};

/// Name of the configuration object watched per managed zone instance
pub const CONFIG_OBJECT_NAME: &str = "skupper-van-form";

/// Key holding the JSON document inside the configuration object
pub const CONFIG_KEY: &str = "config.json";

/// KV mount used when the configuration leaves `path` empty
pub const DEFAULT_MOUNT_PATH: &str = "skupper";

/// A network zone participating in a VAN
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    /// Zones configured to connect into this one
    #[serde(default)]
    pub reachable_from: Vec<String>,
    /// Restricts generated tokens to endpoints on this host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_host: Option<String>,
}

impl Zone {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reachable_from: Vec::new(),
            endpoint_host: None,
        }
    }

    /// Add a zone allowed to connect into this one (duplicates are ignored)
    pub fn reachable_from(mut self, zone: impl Into<String>) -> Self {
        let zone = zone.into();
        if !self.reachable_from.contains(&zone) {
            self.reachable_from.push(zone);
        }
        self
    }

    pub fn endpoint_host(mut self, host: impl Into<String>) -> Self {
        self.endpoint_host = Some(host.into());
        self
    }

    /// A zone is reachable when at least one other zone connects into it.
    pub fn reachable(&self) -> bool {
        !self.reachable_from.is_empty()
    }
}

/// Ordered list of zones making up the VAN topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneList(pub Vec<Zone>);

impl ZoneList {
    pub fn reachable(&self) -> bool {
        self.0.iter().any(Zone::reachable)
    }

    pub fn has_zone(&self, name: &str) -> bool {
        self.0.iter().any(|zone| zone.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Zone> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|zone| zone.name.as_str()).collect()
    }

    /// Every `(zone, target_zone)` reachability edge, in configuration order
    pub fn edges(&self) -> impl Iterator<Item = (&Zone, &str)> {
        self.0.iter().flat_map(|zone| {
            zone.reachable_from
                .iter()
                .map(move |target| (zone, target.as_str()))
        })
    }
}

impl From<Vec<Zone>> for ZoneList {
    fn from(zones: Vec<Zone>) -> Self {
        Self(zones)
    }
}

impl<'a> IntoIterator for &'a ZoneList {
    type Item = &'a Zone;
    type IntoIter = std::slice::Iter<'a, Zone>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Per-instance VAN configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VanConfig {
    /// VAN name, first segment of every key path
    pub van: String,
    /// Address of the shared store
    pub url: String,
    /// KV v2 mount
    #[serde(default)]
    pub path: String,
    /// Name of the secret holding the store credentials
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub zones: ZoneList,
}

impl VanConfig {
    /// Decode the configuration from the data of the config object.
    ///
    /// Applies defaults for the mount and credentials secret name and
    /// validates the result.
    pub fn from_config_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let raw = data.get(CONFIG_KEY).ok_or_else(|| {
            VanFormError::Config(format!(
                "unable to find {} in {} ConfigMap",
                CONFIG_KEY, CONFIG_OBJECT_NAME
            ))
        })?;
        Self::from_json(raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let mut config: VanConfig = serde_json::from_str(raw).map_err(|e| {
            VanFormError::Config(format!(
                "unable to parse {} in {} ConfigMap: {}",
                CONFIG_KEY, CONFIG_OBJECT_NAME, e
            ))
        })?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        if self.path.is_empty() {
            info!(van = %self.van, path = DEFAULT_MOUNT_PATH, "Default Vault path has been set");
            self.path = DEFAULT_MOUNT_PATH.to_string();
        }
        if self.secret.is_empty() {
            self.secret = CONFIG_OBJECT_NAME.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.van.trim().is_empty() {
            return Err(VanFormError::Config("van name must not be empty".to_string()));
        }
        if self.url.trim().is_empty() {
            return Err(VanFormError::Config("store url must not be empty".to_string()));
        }
        let mut seen = HashSet::new();
        for zone in &self.zones {
            if zone.name.trim().is_empty() {
                return Err(VanFormError::Config("zone name must not be empty".to_string()));
            }
            if !seen.insert(zone.name.as_str()) {
                return Err(VanFormError::Config(format!(
                    "zone {} is defined more than once",
                    zone.name
                )));
            }
        }
        Ok(())
    }
}
