use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use super::{
    join_path, parent_path, CoordinationClient, CoordinationMutex, CoordinationResult, LOCK_NODE,
};
use crate::error::{CoordinationError, FsError, Result};

#[derive(Debug, Default)]
struct Inner {
    /// 节点路径 -> 数据，根节点 `/` 隐式存在
    nodes: RwLock<BTreeMap<String, Vec<u8>>>,
    mutexes: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    disconnected: AtomicBool,
}

impl Inner {
    fn check_connected(&self) -> CoordinationResult<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(CoordinationError::ConnectionLoss(
                "memory coordinator is disconnected".to_string(),
            ));
        }
        Ok(())
    }

    fn mutex_for(&self, lock_path: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut mutexes = self.mutexes.lock().unwrap_or_else(PoisonError::into_inner);
        mutexes
            .entry(lock_path.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 删除节点后丢弃对应的互斥锁；仍被持有或等待中的保留
    fn forget_mutexes(&self, removed: &[String]) {
        let mut mutexes = self.mutexes.lock().unwrap_or_else(PoisonError::into_inner);
        for key in removed {
            let idle = mutexes
                .get(key)
                .is_some_and(|mutex| Arc::strong_count(mutex) == 1);
            if idle {
                mutexes.remove(key);
            }
        }
    }
}

fn validate(path: &str) -> CoordinationResult<()> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(CoordinationError::InvalidPath(path.to_string()));
    }
    Ok(())
}

fn exists_in(nodes: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
    path == "/" || nodes.contains_key(path)
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

fn has_children(nodes: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
    let prefix = child_prefix(path);
    nodes
        .range(prefix.clone()..)
        .next()
        .is_some_and(|(key, _)| key.starts_with(&prefix))
}

/// 进程内的协调服务实现，可在多个 FileSystem 实例间共享
///
/// 语义与 ZooKeeper 一致：创建要求父节点存在，已存在的节点不能重复创建，
/// 非递归删除要求没有子节点。
#[derive(Debug, Clone, Default)]
pub struct MemoryCoordinator {
    inner: Arc<Inner>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟会话断开/恢复
    pub fn set_connected(&self, connected: bool) {
        self.inner.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// 进程内仍登记的互斥锁数量
    pub fn mutex_count(&self) -> usize {
        self.inner
            .mutexes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn node_count(&self) -> usize {
        self.inner
            .nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// 从快照文件加载，文件不存在时返回空树
    pub fn load_snapshot(path: &Path) -> Result<Self> {
        let coordinator = Self::new();
        if !path.exists() {
            return Ok(coordinator);
        }
        let text = std::fs::read_to_string(path)?;
        let nodes: BTreeMap<String, Vec<u8>> = serde_json::from_str(&text)?;
        for key in nodes.keys() {
            validate(key).map_err(FsError::from)?;
        }
        info!("从快照加载了 {} 个节点: {:?}", nodes.len(), path);
        *coordinator
            .inner
            .nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner) = nodes;
        Ok(coordinator)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<()> {
        let json = {
            let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_string(&*nodes)?
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        debug!("快照已保存: {:?}", path);
        Ok(())
    }
}

#[async_trait]
impl CoordinationClient for MemoryCoordinator {
    async fn exists<'a>(&'a self, path: &'a str) -> CoordinationResult<bool> {
        self.inner.check_connected()?;
        validate(path)?;
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        Ok(exists_in(&nodes, path))
    }

    async fn create<'a>(&'a self, path: &'a str, create_parents: bool) -> CoordinationResult<()> {
        self.inner.check_connected()?;
        validate(path)?;
        let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if exists_in(&nodes, path) {
            return Err(CoordinationError::NodeExists(path.to_string()));
        }

        let mut missing = Vec::new();
        let mut cursor = parent_path(path);
        while let Some(parent) = cursor {
            if exists_in(&nodes, parent) {
                break;
            }
            if !create_parents {
                return Err(CoordinationError::NoNode(parent.to_string()));
            }
            missing.push(parent.to_string());
            cursor = parent_path(parent);
        }
        for parent in missing.into_iter().rev() {
            nodes.insert(parent, Vec::new());
        }
        nodes.insert(path.to_string(), Vec::new());
        Ok(())
    }

    async fn get_data<'a>(&'a self, path: &'a str) -> CoordinationResult<Vec<u8>> {
        self.inner.check_connected()?;
        validate(path)?;
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if path == "/" {
            return Ok(Vec::new());
        }
        nodes
            .get(path)
            .cloned()
            .ok_or_else(|| CoordinationError::NoNode(path.to_string()))
    }

    async fn set_data<'a>(&'a self, path: &'a str, data: &'a [u8]) -> CoordinationResult<()> {
        self.inner.check_connected()?;
        validate(path)?;
        let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
        match nodes.get_mut(path) {
            Some(slot) => {
                *slot = data.to_vec();
                Ok(())
            }
            None => Err(CoordinationError::NoNode(path.to_string())),
        }
    }

    async fn delete<'a>(&'a self, path: &'a str, recursive: bool) -> CoordinationResult<()> {
        self.inner.check_connected()?;
        validate(path)?;
        if path == "/" {
            return Err(CoordinationError::InvalidPath(path.to_string()));
        }
        let removed = {
            let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
            if !nodes.contains_key(path) {
                return Err(CoordinationError::NoNode(path.to_string()));
            }
            let mut removed = Vec::new();
            if has_children(&nodes, path) {
                if !recursive {
                    return Err(CoordinationError::NotEmpty(path.to_string()));
                }
                let prefix = child_prefix(path);
                removed = nodes
                    .range(prefix.clone()..)
                    .take_while(|(key, _)| key.starts_with(&prefix))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in &removed {
                    nodes.remove(key);
                }
            }
            nodes.remove(path);
            removed.push(path.to_string());
            removed
        };
        self.inner.forget_mutexes(&removed);
        Ok(())
    }

    async fn list_children<'a>(&'a self, path: &'a str) -> CoordinationResult<Vec<String>> {
        self.inner.check_connected()?;
        validate(path)?;
        let nodes = self.inner.nodes.read().unwrap_or_else(PoisonError::into_inner);
        if !exists_in(&nodes, path) {
            return Err(CoordinationError::NoNode(path.to_string()));
        }
        let prefix = child_prefix(path);
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, _)| &key[prefix.len()..])
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect())
    }

    fn mutex(&self, name: &str, path: &str) -> Box<dyn CoordinationMutex> {
        Box::new(MemoryMutex {
            inner: self.inner.clone(),
            name: name.to_string(),
            lock_path: join_path(path, LOCK_NODE),
            guard: None,
        })
    }

    fn is_connected(&self) -> bool {
        !self.inner.disconnected.load(Ordering::SeqCst)
    }
}

/// 基于 tokio 互斥锁的命名锁，持有期间在被锁节点下保留 `__lock__` 子节点
struct MemoryMutex {
    inner: Arc<Inner>,
    name: String,
    lock_path: String,
    guard: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl CoordinationMutex for MemoryMutex {
    async fn acquire(&mut self, timeout: Duration) -> CoordinationResult<bool> {
        self.inner.check_connected()?;
        if self.guard.is_some() {
            return Ok(true);
        }

        let mutex = {
            let mut nodes = self.inner.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let target = parent_path(&self.lock_path).unwrap_or("/");
            if !exists_in(&nodes, target) {
                return Err(CoordinationError::NoNode(target.to_string()));
            }
            nodes.entry(self.lock_path.clone()).or_default();
            self.inner.mutex_for(&self.lock_path)
        };

        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                debug!("获取锁 {} ({})", self.name, self.lock_path);
                self.guard = Some(guard);
                Ok(true)
            }
            Err(_) => {
                debug!("等待锁超时 {} ({})", self.name, self.lock_path);
                Ok(false)
            }
        }
    }

    fn release(&mut self) -> CoordinationResult<()> {
        if self.guard.take().is_some() {
            debug!("释放锁 {} ({})", self.name, self.lock_path);
        }
        Ok(())
    }

    fn is_held(&self) -> bool {
        self.guard.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_requires_parent() {
        let zk = MemoryCoordinator::new();
        assert_eq!(
            zk.create("/a/b", false).await,
            Err(CoordinationError::NoNode("/a".to_string()))
        );
        zk.create("/a/b", true).await.unwrap();
        assert!(zk.exists("/a").await.unwrap());
        assert!(zk.exists("/a/b").await.unwrap());
        assert_eq!(
            zk.create("/a/b", false).await,
            Err(CoordinationError::NodeExists("/a/b".to_string()))
        );
    }

    #[tokio::test]
    async fn test_children_and_delete() {
        let zk = MemoryCoordinator::new();
        zk.create("/r/x", true).await.unwrap();
        zk.create("/r/y", false).await.unwrap();
        zk.create("/r/y/z", false).await.unwrap();
        zk.create("/rr", false).await.unwrap();

        let mut children = zk.list_children("/r").await.unwrap();
        children.sort();
        assert_eq!(children, vec!["x".to_string(), "y".to_string()]);

        assert_eq!(
            zk.delete("/r/y", false).await,
            Err(CoordinationError::NotEmpty("/r/y".to_string()))
        );
        zk.delete("/r", true).await.unwrap();
        assert!(!zk.exists("/r/y/z").await.unwrap());
        assert!(zk.exists("/rr").await.unwrap());
    }

    #[tokio::test]
    async fn test_data_round_trip() {
        let zk = MemoryCoordinator::new();
        zk.create("/n", false).await.unwrap();
        zk.set_data("/n", b"hello").await.unwrap();
        assert_eq!(zk.get_data("/n").await.unwrap(), b"hello".to_vec());
        assert!(zk.set_data("/missing", b"x").await.is_err());
    }

    #[tokio::test]
    async fn test_mutex_excludes_and_times_out() {
        let zk = MemoryCoordinator::new();
        zk.create("/n", false).await.unwrap();

        let mut first = zk.mutex("test", "/n");
        let mut second = zk.mutex("test", "/n");
        assert!(first.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(zk.exists("/n/__lock__").await.unwrap());
        assert!(!second.acquire(Duration::from_millis(50)).await.unwrap());

        first.release().unwrap();
        assert!(second.acquire(Duration::from_millis(100)).await.unwrap());
        assert!(second.is_held());
    }

    #[tokio::test]
    async fn test_delete_forgets_idle_mutexes() {
        let zk = MemoryCoordinator::new();
        zk.create("/a/b", true).await.unwrap();
        zk.create("/keep", false).await.unwrap();

        for path in ["/a", "/a/b", "/keep"] {
            let mut mutex = zk.mutex("test", path);
            assert!(mutex.acquire(Duration::from_millis(50)).await.unwrap());
            mutex.release().unwrap();
        }
        let mut held = zk.mutex("held", "/a/b");
        assert!(held.acquire(Duration::from_millis(50)).await.unwrap());
        assert_eq!(zk.mutex_count(), 3);

        zk.delete("/a", true).await.unwrap();
        // 被持有的锁保留，直到持有者释放
        assert_eq!(zk.mutex_count(), 2);
        held.release().unwrap();
        assert!(!zk.exists("/a/b/__lock__").await.unwrap());

        zk.delete("/keep/__lock__", false).await.unwrap();
        assert_eq!(zk.mutex_count(), 1);
        assert_eq!(zk.node_count(), 1);
    }

    #[tokio::test]
    async fn test_mutex_requires_target() {
        let zk = MemoryCoordinator::new();
        let mut mutex = zk.mutex("test", "/missing");
        assert!(mutex.acquire(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test]
    async fn test_disconnected() {
        let zk = MemoryCoordinator::new();
        zk.set_connected(false);
        assert!(matches!(
            zk.exists("/").await,
            Err(CoordinationError::ConnectionLoss(_))
        ));
        zk.set_connected(true);
        assert!(zk.exists("/").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("tree.json");

        let zk = MemoryCoordinator::new();
        zk.create("/a/b", true).await.unwrap();
        zk.set_data("/a/b", b"payload").await.unwrap();
        zk.save_snapshot(&file).unwrap();

        let restored = MemoryCoordinator::load_snapshot(&file).unwrap();
        assert_eq!(restored.node_count(), 2);
        assert_eq!(restored.get_data("/a/b").await.unwrap(), b"payload".to_vec());
    }
}
