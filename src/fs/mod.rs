use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, BackendRegistry, InodeReader, InodeWriter};
use crate::compress;
use crate::config::FsConfig;
use crate::coordination::CoordinationClient;
use crate::error::{FsError, Result};
use crate::inode::{Domain, Inode, InodeType, PathInfo};
use crate::janitor::TmpJanitor;
use crate::lease::LeaseManager;
use crate::path::PathResolver;
use crate::registry::DomainRegistry;
use crate::state::{FsState, SharedState};
use crate::store::InodeStore;

/// 初始化所需的外部协作方
#[derive(Debug, Clone)]
pub struct FsEnv {
    pub client: Arc<dyn CoordinationClient>,
    pub backends: BackendRegistry,
}

impl FsEnv {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client,
            backends: BackendRegistry::with_defaults(),
        }
    }
}

/// 生成实例身份 `<name>@<hostname>/<uuid>`，取不到主机名时用 `localhost`
fn generate_client_id(name: &str) -> String {
    let host = whoami::fallible::hostname().unwrap_or_else(|e| {
        warn!("无法获取主机名: {}", e);
        "localhost".to_string()
    });
    format!("{}@{}/{}", name, host, Uuid::new_v4())
}

/// 多租户虚拟文件系统的入口
///
/// 容器根目录和实例身份在 `init` 时载入内存，之后不会从协调服务刷新：
/// 其他进程对容器根节点的修改在本实例关闭前都不可见。
pub struct FileSystem {
    config: FsConfig,
    client_id: String,
    state: SharedState,
    registry: DomainRegistry,
    store: Arc<InodeStore>,
    leases: LeaseManager,
    backend: Arc<dyn Backend>,
    tmp_dir: PathBuf,
    janitor: Mutex<Option<JoinHandle<()>>>,
}

impl FileSystem {
    pub async fn init(config: FsConfig, env: FsEnv) -> Result<Self> {
        config.validate()?;
        let state = SharedState::new(FsState::Initializing);
        if !env.client.is_connected() {
            return Err(FsError::State(
                "coordination service is not connected".to_string(),
            ));
        }

        let backend = env.backends.build(&config.backend)?;
        let registry =
            DomainRegistry::bootstrap(env.client.as_ref(), &config, config.lock_timeout()).await?;
        let store = Arc::new(InodeStore::new(
            env.client.clone(),
            registry.resolver()?,
            config.lock_timeout(),
        ));

        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| generate_client_id(&config.name));
        let tmp_dir = config.identity_tmp_dir(&client_id);
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let leases = LeaseManager::new(store.clone(), &client_id, tmp_dir.join("leases"));

        state.set(FsState::Connected);
        let janitor = if config.cleanup_enabled {
            Some(
                TmpJanitor::new(
                    tmp_dir.clone(),
                    config.tmp_ttl(),
                    config.cleanup_interval(),
                    state.clone(),
                )
                .spawn(),
            )
        } else {
            None
        };

        info!(
            "文件系统 {} 初始化完成: 身份={}, 容器={:?}, 后端={}",
            config.name,
            client_id,
            registry.domains().iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            backend.kind()
        );

        Ok(Self {
            config,
            client_id,
            state,
            registry,
            store,
            leases,
            backend,
            tmp_dir,
            janitor: Mutex::new(janitor),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> FsState {
        self.state.get()
    }

    pub fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub fn default_domain(&self) -> &str {
        self.registry.default_domain()
    }

    pub fn domains(&self) -> Vec<Domain> {
        self.registry.domains()
    }

    /// 启动时载入的容器根目录
    pub fn root(&self, domain: &str) -> Result<&Inode> {
        self.ensure_connected()?;
        self.registry
            .root(domain)
            .ok_or_else(|| FsError::NotFound(format!("domain {}", domain)))
    }

    fn ensure_connected(&self) -> Result<()> {
        match self.state.get() {
            FsState::Connected => Ok(()),
            other => Err(FsError::State(format!(
                "file system {} is {:?}",
                self.config.name, other
            ))),
        }
    }

    /// 连接丢失时把实例标记为错误
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_connection_loss() {
                error!("协调服务连接丢失: {}", e);
                self.state.set(FsState::Error);
            }
        }
        result
    }

    pub async fn get(&self, info: &PathInfo) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.store.get_inode(info).await)
    }

    /// 在容器中创建文件，缺失的父目录一并创建
    pub async fn create(&self, domain: &str, path: &str) -> Result<Inode> {
        self.create_at(&PathInfo::new(domain, path)).await
    }

    pub async fn create_at(&self, info: &PathInfo) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.store.create_inode(InodeType::File, info).await)
    }

    /// 创建归档标记
    pub async fn create_archive(&self, info: &PathInfo) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.store.create_inode(InodeType::Archive, info).await)
    }

    pub async fn mkdir(&self, parent: &Inode, name: &str) -> Result<Inode> {
        self.ensure_connected()?;
        if !parent.is_directory() {
            return Err(FsError::InvalidOperation(format!(
                "not a directory: {}",
                parent.absolute_path
            )));
        }
        if name.is_empty() || name.contains('/') {
            return Err(FsError::InvalidPath(format!("invalid name {:?}", name)));
        }
        let info = PathResolver::child_info(&parent.absolute_path, &parent.domain, name);
        self.track(self.store.create_inode(InodeType::Directory, &info).await)
    }

    pub async fn mkdirs(&self, domain: &str, path: &str) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(
            self.store
                .create_inode(InodeType::Directory, &PathInfo::new(domain, path))
                .await,
        )
    }

    /// 乐观并发写回 inode
    pub async fn update(&self, inode: &Inode) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.store.update_inode(inode, &inode.path_info()).await)
    }

    pub async fn parent(&self, inode: &Inode) -> Result<Option<Inode>> {
        self.ensure_connected()?;
        self.track(self.store.parent(inode).await)
    }

    pub async fn delete(&self, info: &PathInfo, recursive: bool) -> Result<()> {
        self.ensure_connected()?;
        self.track(self.store.delete_inode(info, recursive).await)
    }

    pub async fn list(&self, info: &PathInfo, recursive: bool) -> Result<Vec<Inode>> {
        self.ensure_connected()?;
        self.track(self.store.list(info, recursive).await)
    }

    pub async fn find(
        &self,
        info: &PathInfo,
        dir_regex: Option<&str>,
        file_regex: &str,
    ) -> Result<Vec<Inode>> {
        self.ensure_connected()?;
        self.track(self.store.find(info, dir_regex, file_regex).await)
    }

    pub async fn exists(&self, info: &PathInfo) -> Result<bool> {
        self.ensure_connected()?;
        self.track(self.store.exists(info).await)
    }

    async fn type_of(&self, info: &PathInfo) -> Result<Option<InodeType>> {
        match self.get(info).await {
            Ok(inode) => Ok(Some(inode.inode_type())),
            Err(FsError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn is_directory(&self, info: &PathInfo) -> Result<bool> {
        Ok(self.type_of(info).await? == Some(InodeType::Directory))
    }

    pub async fn is_file(&self, info: &PathInfo) -> Result<bool> {
        Ok(self.type_of(info).await? == Some(InodeType::File))
    }

    pub async fn is_archive(&self, info: &PathInfo) -> Result<bool> {
        Ok(self.type_of(info).await? == Some(InodeType::Archive))
    }

    /// 文件内容写入器，尚未打开
    pub fn writer(&self, inode: &Inode) -> Result<Box<dyn InodeWriter>> {
        self.ensure_connected()?;
        self.backend.writer(inode)
    }

    /// 按路径取写入器，文件不存在时先创建
    pub async fn writer_at(&self, info: &PathInfo) -> Result<Box<dyn InodeWriter>> {
        let inode = self.create_at(info).await?;
        self.writer(&inode)
    }

    pub fn reader(&self, inode: &Inode) -> Result<Box<dyn InodeReader>> {
        self.ensure_connected()?;
        self.backend.reader(inode)
    }

    pub async fn reader_at(&self, info: &PathInfo) -> Result<Box<dyn InodeReader>> {
        let inode = self.get(info).await?;
        self.reader(&inode)
    }

    pub async fn file_lock(&self, node: &Inode) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.leases.file_lock(node).await)
    }

    pub async fn file_unlock(&self, node: &Inode) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.leases.file_unlock(node).await)
    }

    pub async fn file_update_lock(&self, node: &Inode) -> Result<Inode> {
        self.ensure_connected()?;
        self.track(self.leases.file_update_lock(node).await)
    }

    pub async fn is_file_locked(&self, node: &Inode) -> Result<bool> {
        self.ensure_connected()?;
        self.track(self.leases.is_file_locked(node).await)
    }

    pub async fn compress(&self, file: &Path) -> Result<PathBuf> {
        self.ensure_connected()?;
        compress::compress(file).await
    }

    pub async fn decompress(&self, file: &Path) -> Result<PathBuf> {
        self.ensure_connected()?;
        compress::decompress(file).await
    }

    /// 在实例临时目录中创建空文件，由清理任务按 TTL 回收
    pub async fn create_tmp_file(&self, prefix: &str, extension: Option<&str>) -> Result<PathBuf> {
        self.ensure_connected()?;
        let mut name = format!("{}-{}", prefix, Uuid::new_v4());
        if let Some(ext) = extension {
            name.push('.');
            name.push_str(ext.trim_start_matches('.'));
        }
        let path = self.tmp_dir.join(name);
        tokio::fs::File::create(&path).await?;
        Ok(path)
    }

    pub async fn create_tmp_dir(&self, prefix: &str) -> Result<PathBuf> {
        self.ensure_connected()?;
        let path = self.tmp_dir.join(format!("{}-{}", prefix, Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// 关闭实例，停止清理任务；之后的调用都会被拒绝
    pub fn close(&self) {
        self.state.set(FsState::Closed);
        self.stop_janitor();
        info!("文件系统 {} 已关闭", self.config.name);
    }

    fn stop_janitor(&self) {
        let handle = self
            .janitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.stop_janitor();
    }
}

impl std::fmt::Debug for FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystem")
            .field("name", &self.config.name)
            .field("client_id", &self.client_id)
            .field("state", &self.state.get())
            .field("backend", &self.backend.kind())
            .finish()
    }
}
