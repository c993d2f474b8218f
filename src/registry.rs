use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::FsConfig;
use crate::coordination::{join_path, CoordinationClient};
use crate::error::{CoordinationError, FsError, Result};
use crate::inode::{Domain, Inode};
use crate::lock::DistributedLock;
use crate::path::{DomainRoot, PathResolver};

/// 容器根目录的进程内快照
///
/// 只在启动时从协调树加载一次，之后不会感知其他进程对根节点的修改。
#[derive(Debug, Clone)]
pub struct DomainRegistry {
    roots: HashMap<String, Inode>,
    domains: HashMap<String, DomainRoot>,
    default_domain: String,
}

impl DomainRegistry {
    /// 在根锁内为每个容器创建（或加载）根目录 inode
    pub async fn bootstrap(
        client: &dyn CoordinationClient,
        config: &FsConfig,
        lock_timeout: Duration,
    ) -> Result<Self> {
        let root = config.coordination_root.as_str();
        match client.create(root, true).await {
            Ok(()) => info!("创建协调根节点: {}", root),
            Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let _lock = DistributedLock::acquire(client, "domains", root, lock_timeout).await?;

        let mut roots = HashMap::new();
        let mut domains = HashMap::new();
        for container in &config.containers {
            let path = join_path(root, &container.name);
            let inode = if client.exists(&path).await? {
                let data = client.get_data(&path).await?;
                if data.is_empty() {
                    Self::write_root(client, &path, container.name.as_str(), &container.root_path).await?
                } else {
                    let inode = Inode::from_bytes(&data)?;
                    debug!("加载容器 {} 根目录 ({})", container.name, inode.uuid);
                    inode
                }
            } else {
                client.create(&path, false).await?;
                let inode = Self::write_root(client, &path, &container.name, &container.root_path).await?;
                info!("创建容器 {} 根目录 {} ({})", container.name, container.root_path, inode.uuid);
                inode
            };

            if !inode.is_directory() {
                return Err(FsError::Configuration(format!(
                    "container root {} is not a directory",
                    path
                )));
            }

            domains.insert(
                container.name.clone(),
                DomainRoot {
                    domain: Domain {
                        name: container.name.clone(),
                        root_absolute_path: inode.absolute_path.clone(),
                        is_default: container.name == config.default_container,
                    },
                    coordination_path: path,
                },
            );
            roots.insert(container.name.clone(), inode);
        }

        if !roots.contains_key(&config.default_container) {
            return Err(FsError::Configuration(format!(
                "default container {} is not configured",
                config.default_container
            )));
        }

        Ok(Self {
            roots,
            domains,
            default_domain: config.default_container.clone(),
        })
    }

    async fn write_root(
        client: &dyn CoordinationClient,
        path: &str,
        name: &str,
        root_path: &str,
    ) -> Result<Inode> {
        let inode = Inode::new_directory(name, name, root_path, path, None);
        client.set_data(path, &inode.to_bytes()?).await?;
        Ok(inode)
    }

    pub fn root(&self, domain: &str) -> Option<&Inode> {
        self.roots.get(domain)
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.domains.values().map(|root| root.domain.clone()).collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        domains
    }

    pub fn resolver(&self) -> Result<PathResolver> {
        PathResolver::new(self.domains.clone(), &self.default_domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::sample_config;
    use crate::coordination::MemoryCoordinator;
    use crate::inode::PathInfo;

    #[tokio::test]
    async fn test_bootstrap_creates_roots() {
        let zk = MemoryCoordinator::new();
        let config = sample_config(&std::env::temp_dir());

        let registry = DomainRegistry::bootstrap(&zk, &config, Duration::from_secs(1)).await.unwrap();
        assert_eq!(registry.default_domain(), "docs");
        assert_eq!(registry.domains().len(), 2);
        assert!(registry.domains().iter().any(|d| d.name == "docs" && d.is_default));

        let docs = registry.root("docs").unwrap();
        assert!(docs.is_directory());
        assert_eq!(docs.absolute_path, "/docs");
        assert_eq!(docs.coordination_path, "/metavfs/docs");
        assert!(zk.exists("/metavfs/media").await.unwrap());
    }

    #[tokio::test]
    async fn test_bootstrap_idempotent() {
        let zk = MemoryCoordinator::new();
        let config = sample_config(&std::env::temp_dir());

        let first = DomainRegistry::bootstrap(&zk, &config, Duration::from_secs(1)).await.unwrap();
        let second = DomainRegistry::bootstrap(&zk, &config, Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            first.root("docs").unwrap().uuid,
            second.root("docs").unwrap().uuid
        );
    }

    #[tokio::test]
    async fn test_resolver_uses_roots() {
        let zk = MemoryCoordinator::new();
        let config = sample_config(&std::env::temp_dir());
        let registry = DomainRegistry::bootstrap(&zk, &config, Duration::from_secs(1)).await.unwrap();

        let resolver = registry.resolver().unwrap();
        let resolved = resolver.resolve(&PathInfo::new("media", "/media/x.png")).unwrap();
        assert_eq!(resolved.coordination_path(), "/metavfs/media/x.png");
    }
}
