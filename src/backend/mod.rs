use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::error::{FsError, Result};
use crate::inode::Inode;

mod local;

pub use local::LocalBackend;

/// 文件内容写入器
#[async_trait]
pub trait InodeWriter: Send + Sync {
    /// 打开；`overwrite` 为 false 时追加
    async fn open(&mut self, overwrite: bool) -> Result<()>;
    /// 写入 `buf[offset..offset + length]`
    async fn write(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<()>;
    async fn flush(&mut self) -> Result<()>;
    /// 把文件长度设置为 `offset + length`
    async fn truncate(&mut self, offset: u64, length: u64) -> Result<()>;
    fn is_open(&self) -> bool;
    async fn close(&mut self) -> Result<()>;
}

/// 文件内容读取器
#[async_trait]
pub trait InodeReader: Send + Sync {
    async fn open(&mut self) -> Result<()>;
    /// 读入 `buf[offset..offset + length]`，返回读到的字节数，0 表示结束
    async fn read(&mut self, buf: &mut [u8], offset: usize, length: usize) -> Result<usize>;
    async fn seek(&mut self, position: u64) -> Result<()>;
    /// 把内容复制为本地文件，inode 标记为压缩时先解压
    async fn copy(&mut self, dest: &Path) -> Result<u64>;
    fn is_open(&self) -> bool;
    async fn close(&mut self) -> Result<()>;
}

/// 内容存储后端
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> &str;
    fn writer(&self, inode: &Inode) -> Result<Box<dyn InodeWriter>>;
    fn reader(&self, inode: &Inode) -> Result<Box<dyn InodeReader>>;
}

pub type BackendConstructor = fn(&BackendConfig) -> Result<Arc<dyn Backend>>;

/// 后端类型名 -> 构造函数
#[derive(Clone)]
pub struct BackendRegistry {
    constructors: HashMap<String, BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// 注册内置的 `local` 后端
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(LocalBackend::KIND, LocalBackend::from_config);
        registry
    }

    pub fn register(&mut self, kind: &str, constructor: BackendConstructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn build(&self, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let constructor = self.constructors.get(&config.kind).ok_or_else(|| {
            FsError::Configuration(format!(
                "unknown backend kind {}, registered: {:?}",
                config.kind,
                self.kinds()
            ))
        })?;
        constructor(config)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

/// inode 内容在后端根目录下的位置
pub(crate) fn content_path(root: &Path, inode: &Inode) -> PathBuf {
    root.join(&inode.domain)
        .join(inode.absolute_path.trim_start_matches('/'))
}
