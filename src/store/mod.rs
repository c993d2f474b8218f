use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, error, info, warn};

use crate::coordination::{join_path, CoordinationClient, LOCK_NODE};
use crate::error::{CoordinationError, FsError, Result};
use crate::inode::{Inode, InodeType, PathInfo};
use crate::lock::DistributedLock;
use crate::path::{PathResolver, ResolvedPath};

/// inode 记录在协调树上的读写与创建、更新、删除、列举、查找算法
#[derive(Debug)]
pub struct InodeStore {
    client: Arc<dyn CoordinationClient>,
    resolver: PathResolver,
    lock_timeout: Duration,
}

impl InodeStore {
    pub fn new(client: Arc<dyn CoordinationClient>, resolver: PathResolver, lock_timeout: Duration) -> Self {
        Self {
            client,
            resolver,
            lock_timeout,
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn client(&self) -> &dyn CoordinationClient {
        self.client.as_ref()
    }

    /// 读取协调节点上的 inode；节点不存在或尚未写入数据时返回 `None`
    pub async fn read_inode(&self, coordination_path: &str) -> Result<Option<Inode>> {
        let data = match self.client.get_data(coordination_path).await {
            Ok(data) => data,
            Err(CoordinationError::NoNode(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        Ok(Some(Inode::from_bytes(&data)?))
    }

    pub async fn get_inode(&self, info: &PathInfo) -> Result<Inode> {
        let resolved = self.resolver.resolve(info)?;
        self.read_inode(&resolved.coordination_path())
            .await?
            .ok_or_else(|| FsError::NotFound(resolved.absolute_path()))
    }

    pub async fn exists(&self, info: &PathInfo) -> Result<bool> {
        let resolved = self.resolver.resolve(info)?;
        Ok(self.read_inode(&resolved.coordination_path()).await?.is_some())
    }

    /// 按父节点反向引用重新查找父 inode
    pub async fn parent(&self, inode: &Inode) -> Result<Option<Inode>> {
        match &inode.parent {
            Some(parent) => self.read_inode(parent).await,
            None => Ok(None),
        }
    }

    /// 锁住 inode 自身的协调节点
    pub async fn lock_inode(&self, name: &str, inode: &Inode) -> Result<DistributedLock> {
        self.lock_path(name, &inode.coordination_path).await
    }

    pub async fn lock_path(&self, name: &str, coordination_path: &str) -> Result<DistributedLock> {
        DistributedLock::acquire(self.client.as_ref(), name, coordination_path, self.lock_timeout).await
    }

    /// 写入新节点；节点已存在但没有数据（上次创建中断）时直接补写
    async fn persist_new(&self, inode: &Inode) -> Result<()> {
        match self.client.create(&inode.coordination_path, false).await {
            Ok(()) | Err(CoordinationError::NodeExists(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.client
            .set_data(&inode.coordination_path, &inode.to_bytes()?)
            .await?;
        Ok(())
    }

    /// 在调用方已持有 inode 锁时写回记录，更新时间戳保持单调不减
    pub async fn persist_locked(&self, inode: &mut Inode, persisted: &Inode) -> Result<()> {
        let now = Utc::now();
        inode.update_timestamp = now.max(persisted.update_timestamp);
        self.client
            .set_data(&inode.coordination_path, &inode.to_bytes()?)
            .await?;
        Ok(())
    }

    /// 按路径逐段懒创建 inode
    ///
    /// 中间段不存在时在父节点锁内二次检查后创建目录；末段在父节点锁内创建
    /// 请求的类型。并发创建同一路径的调用方最终得到同一组 inode。
    pub async fn create_inode(&self, inode_type: InodeType, info: &PathInfo) -> Result<Inode> {
        if inode_type == InodeType::Temp {
            return Err(FsError::InvalidOperation(
                "temp files are not registered in the coordination tree".to_string(),
            ));
        }

        let resolved = self.resolver.resolve(info)?;
        if resolved.is_root() {
            let root = self
                .read_inode(&resolved.coordination_path())
                .await?
                .ok_or_else(|| FsError::NotFound(format!("root of domain {}", resolved.domain)))?;
            if inode_type == InodeType::Directory {
                return Ok(root);
            }
            return Err(FsError::Conflict(format!(
                "{} is a container root",
                resolved.absolute_path()
            )));
        }

        let depth = resolved.depth();
        for level in 1..depth {
            self.ensure_directory(&resolved, level).await?;
        }
        self.create_terminal(inode_type, &resolved, info).await
    }

    async fn ensure_directory(&self, resolved: &ResolvedPath, level: usize) -> Result<Inode> {
        let path = resolved.coordination_path_at(level);

        // 已存在时无需加锁
        if let Some(existing) = self.read_inode(&path).await? {
            return require_directory(existing);
        }

        let parent = resolved.coordination_path_at(level - 1);
        let _lock = self.lock_path("mkdir", &parent).await?;
        if let Some(existing) = self.read_inode(&path).await? {
            debug!("目录已被其他进程创建: {}", path);
            return require_directory(existing);
        }

        let inode = Inode::new_directory(
            &resolved.segments[level - 1],
            &resolved.domain,
            &resolved.absolute_path_at(level),
            &path,
            Some(parent),
        );
        self.persist_new(&inode).await?;
        debug!("创建目录 {} ({})", inode.absolute_path, inode.uuid);
        Ok(inode)
    }

    async fn create_terminal(
        &self,
        inode_type: InodeType,
        resolved: &ResolvedPath,
        info: &PathInfo,
    ) -> Result<Inode> {
        let path = resolved.coordination_path();
        let parent = resolved.coordination_path_at(resolved.depth() - 1);
        let _lock = self.lock_path("create", &parent).await?;

        if let Some(existing) = self.read_inode(&path).await? {
            if existing.inode_type() == inode_type {
                return Ok(existing);
            }
            return Err(FsError::Conflict(format!(
                "{:?} requested at {} but a {:?} exists",
                inode_type,
                existing.absolute_path,
                existing.inode_type()
            )));
        }

        let name = resolved.name();
        let absolute = resolved.absolute_path();
        let parent_ref = Some(parent.clone());
        let mut inode = match inode_type {
            InodeType::Directory => {
                Inode::new_directory(name, &resolved.domain, &absolute, &path, parent_ref)
            }
            InodeType::File => Inode::new_file(name, &resolved.domain, &absolute, &path, parent_ref),
            InodeType::Archive => {
                Inode::new_archive(name, &resolved.domain, &absolute, &path, parent_ref)
            }
            InodeType::Temp => unreachable!("rejected before the walk"),
        };
        inode.path_config = info.path_config.clone();
        self.persist_new(&inode).await?;
        debug!("创建 {:?} {} ({})", inode_type, inode.absolute_path, inode.uuid);
        Ok(inode)
    }

    /// 乐观并发更新：持久化版本比提交版本新时拒绝写入
    ///
    /// 时间戳相等的提交会被接受，这样刚读出的 inode 总能原样写回；
    /// 只有严格更旧的提交才返回 `StaleWrite`。写入的时间戳取
    /// `max(now, 持久化时间戳)`，保持单调不减。
    pub async fn update_inode(&self, inode: &Inode, info: &PathInfo) -> Result<Inode> {
        let current = self.get_inode(info).await?;
        check_update(&current, inode)?;

        let _lock = self.lock_inode("update", &current).await?;
        // 锁内重新读取，防止检查与加锁之间的并发写入
        let persisted = self.get_inode(info).await?;
        check_update(&persisted, inode)?;

        let mut next = inode.clone();
        self.persist_locked(&mut next, &persisted).await?;
        debug!("更新 {} -> {}", next.absolute_path, next.update_timestamp);
        Ok(next)
    }

    /// 删除 inode
    ///
    /// 递归删除整棵子树；非递归删除只允许叶子节点：清空数据、删掉锁子节点，
    /// 再删除节点本身。
    pub async fn delete_inode(&self, info: &PathInfo, recursive: bool) -> Result<()> {
        let current = self.get_inode(info).await?;
        let parent = current.parent.clone().ok_or_else(|| {
            FsError::InvalidOperation(format!("cannot delete root {}", current.absolute_path))
        })?;

        let _lock = self.lock_path("delete", &parent).await?;
        let path = current.coordination_path.as_str();

        if recursive {
            self.client.delete(path, true).await?;
            info!("递归删除 {}", current.absolute_path);
            return Ok(());
        }

        let children = self.client.list_children(path).await?;
        if children.iter().any(|child| child != LOCK_NODE) {
            return Err(FsError::Conflict(format!(
                "{} has children, use recursive delete",
                current.absolute_path
            )));
        }

        self.client.set_data(path, &[]).await?;
        for child in children.iter().filter(|child| *child == LOCK_NODE) {
            match self.client.delete(&join_path(path, child), false).await {
                Ok(()) | Err(CoordinationError::NoNode(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Err(e) = self.client.delete(path, false).await {
            // 清空数据之后有并发创建的子节点，写回原记录
            warn!("删除 {} 失败，恢复记录: {}", current.absolute_path, e);
            if let Err(restore) = self.client.set_data(path, &current.to_bytes()?).await {
                error!("恢复 {} 的记录失败: {}", current.absolute_path, restore);
            }
            return Err(e.into());
        }
        info!("删除 {}", current.absolute_path);
        Ok(())
    }

    /// 列出目录下的文件；`recursive` 时展开子目录，否则子目录也作为条目返回
    pub async fn list(&self, info: &PathInfo, recursive: bool) -> Result<Vec<Inode>> {
        let dir = self.get_inode(info).await?;
        if !dir.is_directory() {
            return Err(FsError::InvalidOperation(format!(
                "not a directory: {}",
                dir.absolute_path
            )));
        }

        let mut entries = Vec::new();
        let mut pending = vec![dir.coordination_path];
        while let Some(dir_path) = pending.pop() {
            let mut children = match self.client.list_children(&dir_path).await {
                Ok(children) => children,
                // 遍历期间被并发删除
                Err(CoordinationError::NoNode(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            children.sort();

            for child in children.into_iter().filter(|name| name != LOCK_NODE) {
                let child_path = join_path(&dir_path, &child);
                let Some(inode) = self.read_inode(&child_path).await? else {
                    warn!("跳过没有记录的节点: {}", child_path);
                    continue;
                };
                if inode.is_directory() && recursive {
                    pending.push(child_path);
                } else {
                    entries.push(inode);
                }
            }
        }
        Ok(entries)
    }

    /// 在子树中查找文件，目录和文件名都按整串匹配
    pub async fn find(
        &self,
        info: &PathInfo,
        dir_regex: Option<&str>,
        file_regex: &str,
    ) -> Result<Vec<Inode>> {
        let dir_re = dir_regex.map(full_match).transpose()?;
        let file_re = full_match(file_regex)?;

        let found = self
            .list(info, true)
            .await?
            .into_iter()
            .filter(|inode| inode.is_file())
            .filter(|inode| {
                dir_re
                    .as_ref()
                    .map_or(true, |re| re.is_match(inode.parent_absolute_path()))
            })
            .filter(|inode| file_re.is_match(&inode.name))
            .collect();
        Ok(found)
    }
}

fn require_directory(inode: Inode) -> Result<Inode> {
    if inode.is_directory() {
        Ok(inode)
    } else {
        Err(FsError::Conflict(format!(
            "{} is not a directory",
            inode.absolute_path
        )))
    }
}

fn check_update(persisted: &Inode, incoming: &Inode) -> Result<()> {
    if persisted.coordination_path != incoming.coordination_path {
        return Err(FsError::Conflict(format!(
            "inode {} does not live at {}",
            incoming.coordination_path, persisted.coordination_path
        )));
    }
    if persisted.update_timestamp > incoming.update_timestamp {
        return Err(FsError::StaleWrite {
            path: persisted.absolute_path.clone(),
            persisted: persisted.update_timestamp.to_rfc3339(),
            supplied: incoming.update_timestamp.to_rfc3339(),
        });
    }
    Ok(())
}

/// 编译为整串匹配的正则
fn full_match(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| FsError::InvalidOperation(format!("invalid pattern {:?}: {}", pattern, e)))
}
