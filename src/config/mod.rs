use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{FsError, Result};

/// 清理周期下限
pub const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

fn default_ttl_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

/// 容器（租户）配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    /// 容器根目录的绝对路径，例如 `/docs`
    pub root_path: String,
}

/// 内容后端配置，`kind` 在 [`crate::backend::BackendRegistry`] 中查找
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: String,
    pub root: PathBuf,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// 文件系统实例名
    pub name: String,
    /// 协调树中的根节点路径
    pub coordination_root: String,
    pub containers: Vec<ContainerConfig>,
    pub default_container: String,
    /// 本地临时目录，实际使用 `tmp_dir/<name>/<身份>`
    pub tmp_dir: PathBuf,
    #[serde(default = "default_ttl_secs")]
    pub tmp_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// 实例身份，缺省时自动生成
    #[serde(default)]
    pub client_id: Option<String>,
    pub backend: BackendConfig,
}

impl FsConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| FsError::Configuration(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() || self.name.contains('/') {
            return Err(FsError::Configuration(format!(
                "invalid instance name: {:?}",
                self.name
            )));
        }
        if !self.coordination_root.starts_with('/') || self.coordination_root.len() < 2 {
            return Err(FsError::Configuration(format!(
                "coordination root must be an absolute, non-root path: {:?}",
                self.coordination_root
            )));
        }
        if self.coordination_root.ends_with('/') {
            return Err(FsError::Configuration(format!(
                "coordination root must not end with '/': {:?}",
                self.coordination_root
            )));
        }
        if self.containers.is_empty() {
            return Err(FsError::Configuration("no containers configured".to_string()));
        }

        let mut seen = HashSet::new();
        for container in &self.containers {
            if container.name.is_empty() || container.name.contains('/') {
                return Err(FsError::Configuration(format!(
                    "invalid container name: {:?}",
                    container.name
                )));
            }
            if !seen.insert(container.name.as_str()) {
                return Err(FsError::Configuration(format!(
                    "duplicate container: {}",
                    container.name
                )));
            }
            if !container.root_path.starts_with('/') {
                return Err(FsError::Configuration(format!(
                    "container {} root must be absolute: {:?}",
                    container.name, container.root_path
                )));
            }
        }
        if !seen.contains(self.default_container.as_str()) {
            return Err(FsError::Configuration(format!(
                "default container {} is not configured",
                self.default_container
            )));
        }
        if self.lock_timeout_ms == 0 {
            return Err(FsError::Configuration("lock timeout must be positive".to_string()));
        }
        if self.backend.kind.is_empty() {
            return Err(FsError::Configuration("backend kind is empty".to_string()));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn tmp_ttl(&self) -> Duration {
        Duration::from_secs(self.tmp_ttl_secs)
    }

    /// 清理周期，低于下限时按下限处理
    pub fn cleanup_interval(&self) -> Duration {
        let interval = Duration::from_secs(self.cleanup_interval_secs);
        if interval < MIN_CLEANUP_INTERVAL {
            warn!(
                "清理周期 {:?} 过短，使用下限 {:?}",
                interval, MIN_CLEANUP_INTERVAL
            );
            MIN_CLEANUP_INTERVAL
        } else {
            interval
        }
    }

    /// 本实例的临时目录
    pub fn instance_tmp_dir(&self) -> PathBuf {
        self.tmp_dir.join(&self.name)
    }

    /// 按实例身份隔离的临时目录，同名实例互不清理对方的文件
    pub fn identity_tmp_dir(&self, client_id: &str) -> PathBuf {
        let key: String = client_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.instance_tmp_dir().join(key)
    }

    pub fn container(&self, name: &str) -> Option<&ContainerConfig> {
        self.containers.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_config(tmp: &std::path::Path) -> FsConfig {
        FsConfig {
            name: "node1".to_string(),
            coordination_root: "/metavfs".to_string(),
            containers: vec![
                ContainerConfig {
                    name: "docs".to_string(),
                    root_path: "/docs".to_string(),
                },
                ContainerConfig {
                    name: "media".to_string(),
                    root_path: "/media".to_string(),
                },
            ],
            default_container: "docs".to_string(),
            tmp_dir: tmp.join("tmp"),
            tmp_ttl_secs: 3600,
            cleanup_enabled: false,
            cleanup_interval_secs: 60,
            lock_timeout_ms: 2_000,
            client_id: None,
            backend: BackendConfig {
                kind: "local".to_string(),
                root: tmp.join("data"),
                options: HashMap::new(),
            },
        }
    }

    #[test]
    fn test_parse_with_defaults() {
        let json = r#"{
            "name": "node1",
            "coordination_root": "/vfs",
            "containers": [{"name": "docs", "root_path": "/docs"}],
            "default_container": "docs",
            "tmp_dir": "/tmp/vfs",
            "backend": {"kind": "local", "root": "/var/lib/vfs"}
        }"#;
        let config = FsConfig::from_json(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.tmp_ttl_secs, 3600);
        assert!(config.cleanup_enabled);
        assert_eq!(config.lock_timeout(), Duration::from_secs(10));
        assert_eq!(config.instance_tmp_dir(), PathBuf::from("/tmp/vfs/node1"));
        assert_eq!(
            config.identity_tmp_dir("node1@host/1234"),
            PathBuf::from("/tmp/vfs/node1/node1_host_1234")
        );
        assert_ne!(config.identity_tmp_dir("X"), config.identity_tmp_dir("Y"));
    }

    #[test]
    fn test_validate_rejects_bad_setup() {
        let tmp = std::env::temp_dir();

        let mut config = sample_config(&tmp);
        config.default_container = "missing".to_string();
        assert!(matches!(config.validate(), Err(FsError::Configuration(_))));

        let mut config = sample_config(&tmp);
        config.containers.push(config.containers[0].clone());
        assert!(matches!(config.validate(), Err(FsError::Configuration(_))));

        let mut config = sample_config(&tmp);
        config.coordination_root = "relative".to_string();
        assert!(matches!(config.validate(), Err(FsError::Configuration(_))));

        let mut config = sample_config(&tmp);
        config.lock_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(FsError::Configuration(_))));
    }

    #[test]
    fn test_cleanup_interval_minimum() {
        let mut config = sample_config(&std::env::temp_dir());
        config.cleanup_interval_secs = 5;
        assert_eq!(config.cleanup_interval(), MIN_CLEANUP_INTERVAL);
        config.cleanup_interval_secs = 120;
        assert_eq!(config.cleanup_interval(), Duration::from_secs(120));
    }
}
