use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{FsError, Result};
use crate::inode::{FileData, FileLease, Inode};
use crate::store::InodeStore;

/// 文件签出/签入，租约绑定到 FileSystem 实例的身份
///
/// 所有读-改-写都在 inode 自身的锁内完成，两个实例同时签出同一文件时只有一个成功。
#[derive(Debug)]
pub struct LeaseManager {
    store: Arc<InodeStore>,
    client_id: String,
    /// 签出文件所在目录
    lease_dir: PathBuf,
}

impl LeaseManager {
    pub fn new(store: Arc<InodeStore>, client_id: &str, lease_dir: PathBuf) -> Self {
        Self {
            store,
            client_id: client_id.to_string(),
            lease_dir,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// 签出文件；同一身份重复签出返回同一租约
    pub async fn file_lock(&self, node: &Inode) -> Result<Inode> {
        let info = node.path_info();
        let _lock = self.store.lock_inode("lease", node).await?;
        let persisted = self.store.get_inode(&info).await?;
        let mut current = persisted.clone();
        let local_name = format!("{}-{}", current.uuid, current.name);
        let path = current.absolute_path.clone();
        let data = current.require_file_data_mut()?;

        let mut lease = match data.lease.take() {
            None => FileLease {
                client_id: self.client_id.clone(),
                local_path: None,
                time_updated: Utc::now(),
            },
            Some(lease) if lease.client_id == self.client_id => lease,
            Some(lease) => {
                return Err(FsError::LockOwnership {
                    path,
                    owner: lease.client_id,
                });
            }
        };

        if lease.local_path.is_none() {
            let local = self.lease_dir.join(local_name);
            tokio::fs::create_dir_all(&self.lease_dir).await?;
            if tokio::fs::try_exists(&local).await? {
                debug!("删除残留的签出文件: {:?}", local);
                tokio::fs::remove_file(&local).await?;
            }
            lease.local_path = Some(local);
        }
        lease.time_updated = Utc::now();
        data.lease = Some(lease);

        self.store.persist_locked(&mut current, &persisted).await?;
        info!("{} 签出 {}", self.client_id, current.absolute_path);
        Ok(current)
    }

    /// 签入文件，释放租约
    pub async fn file_unlock(&self, node: &Inode) -> Result<Inode> {
        let inode = self
            .with_owned_lease(node, |data| {
                data.lease = None;
            })
            .await?;
        info!("{} 签入 {}", self.client_id, inode.absolute_path);
        Ok(inode)
    }

    /// 刷新租约时间，不释放
    pub async fn file_update_lock(&self, node: &Inode) -> Result<Inode> {
        self.with_owned_lease(node, |data| {
            if let Some(lease) = data.lease.as_mut() {
                lease.time_updated = Utc::now();
            }
        })
        .await
    }

    /// 有租约、状态为待更新、且租约属于本实例时才算锁定
    pub async fn is_file_locked(&self, node: &Inode) -> Result<bool> {
        let current = self.store.get_inode(&node.path_info()).await?;
        let Some(data) = current.file_data() else {
            return Ok(false);
        };
        Ok(match &data.lease {
            Some(lease) => data.state.is_pending_update() && lease.client_id == self.client_id,
            None => false,
        })
    }

    async fn with_owned_lease<F>(&self, node: &Inode, apply: F) -> Result<Inode>
    where
        F: FnOnce(&mut FileData),
    {
        let info = node.path_info();
        let _lock = self.store.lock_inode("lease", node).await?;
        let persisted = self.store.get_inode(&info).await?;
        let mut current = persisted.clone();
        let path = current.absolute_path.clone();
        let data = current.require_file_data_mut()?;

        match &data.lease {
            None => return Err(FsError::NotFound(format!("lease on {}", path))),
            Some(lease) if lease.client_id != self.client_id => {
                return Err(FsError::LockOwnership {
                    path,
                    owner: lease.client_id.clone(),
                });
            }
            Some(_) => {}
        }
        apply(data);

        self.store.persist_locked(&mut current, &persisted).await?;
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{FileState, InodeType, PathInfo};
    use crate::store::tests::test_store;
    use tempfile::TempDir;

    async fn managers() -> (TempDir, Arc<InodeStore>, LeaseManager, LeaseManager) {
        let dir = TempDir::new().unwrap();
        let (_zk, store) = test_store().await;
        let store = Arc::new(store);
        let x = LeaseManager::new(store.clone(), "X", dir.path().join("x"));
        let y = LeaseManager::new(store.clone(), "Y", dir.path().join("y"));
        (dir, store, x, y)
    }

    #[tokio::test]
    async fn test_lock_idempotent_for_owner() {
        let (_dir, store, x, _y) = managers().await;
        let file = store
            .create_inode(InodeType::File, &PathInfo::new("docs", "/lease/a.txt"))
            .await
            .unwrap();

        let first = x.file_lock(&file).await.unwrap();
        let second = x.file_lock(&file).await.unwrap();
        let lease1 = first.lease().unwrap();
        let lease2 = second.lease().unwrap();
        assert_eq!(lease1.client_id, "X");
        assert_eq!(lease1.local_path, lease2.local_path);
        assert!(lease2.time_updated >= lease1.time_updated);
        assert!(x.is_file_locked(&file).await.unwrap());
    }

    #[tokio::test]
    async fn test_other_identity_rejected() {
        let (_dir, store, x, y) = managers().await;
        let file = store
            .create_inode(InodeType::File, &PathInfo::new("docs", "/lease/b.txt"))
            .await
            .unwrap();
        x.file_lock(&file).await.unwrap();

        match y.file_lock(&file).await {
            Err(FsError::LockOwnership { owner, .. }) => assert_eq!(owner, "X"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            y.file_unlock(&file).await,
            Err(FsError::LockOwnership { .. })
        ));
        assert!(matches!(
            y.file_update_lock(&file).await,
            Err(FsError::LockOwnership { .. })
        ));
        assert!(!y.is_file_locked(&file).await.unwrap());
    }

    #[tokio::test]
    async fn test_unlock_then_relock_by_other() {
        let (_dir, store, x, y) = managers().await;
        let file = store
            .create_inode(InodeType::File, &PathInfo::new("docs", "/lease/c.txt"))
            .await
            .unwrap();

        assert!(matches!(x.file_unlock(&file).await, Err(FsError::NotFound(_))));

        x.file_lock(&file).await.unwrap();
        let unlocked = x.file_unlock(&file).await.unwrap();
        assert!(unlocked.lease().is_none());
        assert!(!x.is_file_locked(&file).await.unwrap());

        let relocked = y.file_lock(&file).await.unwrap();
        assert_eq!(relocked.lease().unwrap().client_id, "Y");
    }

    #[tokio::test]
    async fn test_update_lock_refreshes() {
        let (_dir, store, x, _y) = managers().await;
        let file = store
            .create_inode(InodeType::File, &PathInfo::new("docs", "/lease/d.txt"))
            .await
            .unwrap();
        let locked = x.file_lock(&file).await.unwrap();
        let refreshed = x.file_update_lock(&file).await.unwrap();
        assert!(refreshed.lease().unwrap().time_updated >= locked.lease().unwrap().time_updated);
        assert_eq!(
            refreshed.lease().unwrap().local_path,
            locked.lease().unwrap().local_path
        );
    }

    #[tokio::test]
    async fn test_locked_requires_pending_update() {
        let (_dir, store, x, _y) = managers().await;
        let info = PathInfo::new("docs", "/lease/e.txt");
        let file = store.create_inode(InodeType::File, &info).await.unwrap();
        let mut locked = x.file_lock(&file).await.unwrap();

        locked.require_file_data_mut().unwrap().state = FileState::Synced;
        store.update_inode(&locked, &info).await.unwrap();
        // 有租约但状态不是待更新
        assert!(!x.is_file_locked(&file).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_local_file_removed() {
        let (dir, store, x, _y) = managers().await;
        let file = store
            .create_inode(InodeType::File, &PathInfo::new("docs", "/lease/f.txt"))
            .await
            .unwrap();
        let stale = dir.path().join("x").join(format!("{}-f.txt", file.uuid));
        std::fs::create_dir_all(stale.parent().unwrap()).unwrap();
        std::fs::write(&stale, b"old").unwrap();

        let locked = x.file_lock(&file).await.unwrap();
        assert_eq!(locked.lease().unwrap().local_path.as_ref(), Some(&stale));
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_directory_cannot_be_leased() {
        let (_dir, store, x, _y) = managers().await;
        let dir = store
            .create_inode(InodeType::Directory, &PathInfo::new("docs", "/lease/dir"))
            .await
            .unwrap();
        assert!(matches!(
            x.file_lock(&dir).await,
            Err(FsError::InvalidOperation(_))
        ));
        assert!(!x.is_file_locked(&dir).await.unwrap());
    }
}
