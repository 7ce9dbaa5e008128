//! TOML configuration for the Atoll daemon.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Node identity and addresses.
    pub node: NodeSection,
    /// Cluster membership and control-plane tuning.
    pub cluster: ClusterSection,
    /// Object storage backend.
    pub store: StoreSection,
    /// S3 surface settings.
    pub s3: S3Section,
    /// Transform-copy engine tuning.
    pub xcopy: XcopySection,
    /// Logging configuration.
    pub log: LogSection,
}

/// `[node]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Node role: `"proxy"` or `"target"`.
    pub role: String,
    /// Directory for persistent data (metadata cache, object files).
    pub data_dir: PathBuf,
    /// Bind address for the public (client-facing) HTTP listener.
    pub listen_pub: String,
    /// Bind address for the intra-cluster control listener.
    pub listen_intra: String,
    /// Public endpoints advertised in the cluster map. Targets may list
    /// more than one (multi-homing).
    pub pub_urls: Vec<String>,
    /// Intra-cluster control endpoint advertised in the cluster map.
    pub intra_url: String,
    /// Direct socket addresses of the data-mover endpoint (targets).
    pub mover_addrs: Vec<std::net::SocketAddr>,
}

impl Default for NodeSection {
    fn default() -> Self {
        let data_dir = dirs::home_dir()
            .map(|h| h.join(".atoll"))
            .unwrap_or_else(|| PathBuf::from(".atoll"));
        Self {
            role: "proxy".to_string(),
            data_dir,
            listen_pub: "0.0.0.0:8080".to_string(),
            listen_intra: "0.0.0.0:9080".to_string(),
            pub_urls: vec!["http://127.0.0.1:8080".to_string()],
            intra_url: "http://127.0.0.1:9080".to_string(),
            mover_addrs: vec![],
        }
    }
}

/// `[cluster]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Cluster name; the data-mover ALPN derives from it.
    pub name: String,
    /// Discovery URL tried when the cached map's primary is unreachable.
    pub discovery_url: String,
    /// Last-resort join candidate: the original primary's URL.
    pub original_primary_url: String,
    /// Cluster-default feature flags, by name.
    pub features: Vec<String>,
    /// Control-plane period in milliseconds.
    pub cplane_period_ms: u64,
    /// Send-file timeout (total quiescence budget) in milliseconds.
    pub send_file_timeout_ms: u64,
    /// Acceptance window for redirected requests, in milliseconds.
    pub max_request_age_ms: u64,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            name: "atoll".to_string(),
            discovery_url: String::new(),
            original_primary_url: String::new(),
            features: vec![],
            cplane_period_ms: 1_000,
            send_file_timeout_ms: 120_000,
            max_request_age_ms: 300_000,
        }
    }
}

/// `[store]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Backend type: `"file"` (default) or `"memory"`.
    pub backend: String,
    /// Mountpath roots for the file backend. Defaults to one path under
    /// the data dir.
    pub mountpaths: Vec<PathBuf>,
    /// Capacity limit for the memory backend, in bytes.
    pub memory_max_bytes: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: "file".to_string(),
            mountpaths: vec![],
            memory_max_bytes: 1 << 30,
        }
    }
}

/// `[s3]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct S3Section {
    /// Redirect HEAD-on-object instead of reverse-proxying it. Off by
    /// default: common S3 clients do not follow redirects on HEAD.
    pub head_via_redirect: bool,
}

impl Default for S3Section {
    fn default() -> Self {
        Self {
            head_via_redirect: false,
        }
    }
}

/// `[xcopy]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct XcopySection {
    pub max_in_parallel: usize,
    pub etl_parallel: usize,
    pub disk_util_high: u8,
}

impl Default for XcopySection {
    fn default() -> Self {
        Self {
            max_in_parallel: 64,
            etl_parallel: 2,
            disk_util_high: 80,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl CliConfig {
    /// Load config from a TOML file, or defaults if no path given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)?;
                Ok(toml::from_str(&content)?)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn cplane_period(&self) -> Duration {
        Duration::from_millis(self.cluster.cplane_period_ms)
    }

    pub fn send_file_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.send_file_timeout_ms)
    }

    pub fn max_request_age(&self) -> Duration {
        Duration::from_millis(self.cluster.max_request_age_ms)
    }

    /// Cluster-default feature bits parsed from the configured names.
    pub fn feature_bits(&self) -> anyhow::Result<u64> {
        atoll_types::features::parse(&self.cluster.features).map_err(anyhow::Error::msg)
    }

    /// Effective mountpath roots for the file backend.
    pub fn mountpaths(&self) -> Vec<PathBuf> {
        if self.store.mountpaths.is_empty() {
            vec![self.node.data_dir.join("mp0")]
        } else {
            self.store.mountpaths.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CliConfig::default();
        assert_eq!(config.node.role, "proxy");
        assert_eq!(config.cluster.cplane_period_ms, 1_000);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.mountpaths().len(), 1);
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: CliConfig = toml::from_str(
            r#"
            [node]
            role = "target"
            listen_pub = "0.0.0.0:18080"
            pub_urls = ["http://a:18080", "http://b:18080"]

            [cluster]
            discovery_url = "http://seed:9080"
            features = ["Fsync-PUT"]

            [store]
            backend = "memory"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.role, "target");
        assert_eq!(config.node.pub_urls.len(), 2);
        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.feature_bits().unwrap(), atoll_types::features::FSYNC_PUT);
    }

    #[test]
    fn test_unknown_feature_rejected() {
        let config: CliConfig = toml::from_str(
            r#"
            [cluster]
            features = ["Not-A-Flag"]
            "#,
        )
        .unwrap();
        assert!(config.feature_bits().is_err());
    }
}
