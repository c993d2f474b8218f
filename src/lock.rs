use std::time::Duration;

use tracing::{debug, error};

use crate::coordination::{CoordinationClient, CoordinationMutex};
use crate::error::{CoordinationError, FsError, Result};

/// 绑定到某个协调路径的分布式锁
///
/// 获取成功后持有锁，`unlock` 或 drop 时释放，所以任何返回路径上都会解锁。
pub struct DistributedLock {
    /// 锁名，仅用于日志和错误信息
    name: String,
    /// 被锁的协调路径
    path: String,
    mutex: Box<dyn CoordinationMutex>,
    /// 是否已经获取锁
    locked: bool,
}

impl DistributedLock {
    /// 在 `timeout` 内获取锁
    ///
    /// 目标节点不存在或等待超时都返回 `LockAcquisition`。
    pub async fn acquire(
        client: &dyn CoordinationClient,
        name: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<Self> {
        if !client.exists(path).await? {
            return Err(FsError::LockAcquisition {
                name: name.to_string(),
                path: path.to_string(),
                reason: "lock target does not exist".to_string(),
            });
        }

        let mut mutex = client.mutex(name, path);
        let acquired = match mutex.acquire(timeout).await {
            Ok(acquired) => acquired,
            // 检查之后目标被并发删除
            Err(CoordinationError::NoNode(_)) => {
                return Err(FsError::LockAcquisition {
                    name: name.to_string(),
                    path: path.to_string(),
                    reason: "lock target does not exist".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        if !acquired {
            return Err(FsError::LockAcquisition {
                name: name.to_string(),
                path: path.to_string(),
                reason: format!("timed out after {:?}", timeout),
            });
        }

        debug!("成功获取锁 {}: {}", name, path);
        Ok(Self {
            name: name.to_string(),
            path: path.to_string(),
            mutex,
            locked: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// 检查是否仍持有锁
    pub fn is_locked(&self) -> bool {
        self.locked && self.mutex.is_held()
    }

    /// 释放锁，重复调用无副作用
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.mutex.release()?;
        self.locked = false;
        debug!("已释放锁 {}: {}", self.name, self.path);
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock() {
                error!("释放锁 {} 失败 ({}): {}", self.name, self.path, e);
            }
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("locked", &self.locked)
            .finish()
    }
}
