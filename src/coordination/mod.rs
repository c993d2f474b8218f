use std::time::Duration;

use async_trait::async_trait;

use crate::error::CoordinationError;

mod memory;

pub use memory::MemoryCoordinator;

/// 互斥锁在被锁节点下创建的保留子节点名
pub const LOCK_NODE: &str = "__lock__";

pub type CoordinationResult<T> = std::result::Result<T, CoordinationError>;

/// 协调服务提供的命名互斥锁
#[async_trait]
pub trait CoordinationMutex: Send + Sync {
    /// 在 `timeout` 内获取锁，超时返回 `Ok(false)`
    async fn acquire(&mut self, timeout: Duration) -> CoordinationResult<bool>;

    /// 释放锁；未持有时为空操作
    fn release(&mut self) -> CoordinationResult<()>;

    fn is_held(&self) -> bool;
}

/// 强一致的层级键值存储（ZooKeeper 风格）
#[async_trait]
pub trait CoordinationClient: Send + Sync + std::fmt::Debug {
    async fn exists<'a>(&'a self, path: &'a str) -> CoordinationResult<bool>;
    async fn create<'a>(&'a self, path: &'a str, create_parents: bool) -> CoordinationResult<()>;
    async fn get_data<'a>(&'a self, path: &'a str) -> CoordinationResult<Vec<u8>>;
    async fn set_data<'a>(&'a self, path: &'a str, data: &'a [u8]) -> CoordinationResult<()>;
    async fn delete<'a>(&'a self, path: &'a str, recursive: bool) -> CoordinationResult<()>;
    async fn list_children<'a>(&'a self, path: &'a str) -> CoordinationResult<Vec<String>>;

    /// 绑定到 `path` 的命名互斥锁，调用 `acquire` 之前不做任何远程操作
    fn mutex(&self, name: &str, path: &str) -> Box<dyn CoordinationMutex>;

    fn is_connected(&self) -> bool;
}

/// 拼接协调路径
pub fn join_path(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", parent, child)
    }
}

/// 父节点路径，根节点返回 `None`
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// 节点名（最后一段）
pub fn node_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_helpers() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(node_name("/a/b"), "b");
    }
}
