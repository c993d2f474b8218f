use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::state::{FsState, SharedState};

/// 定期清理实例临时目录中超过 TTL 的文件
#[derive(Debug, Clone)]
pub struct TmpJanitor {
    dir: PathBuf,
    ttl: Duration,
    interval: Duration,
    state: SharedState,
}

impl TmpJanitor {
    pub fn new(dir: PathBuf, ttl: Duration, interval: Duration, state: SharedState) -> Self {
        Self {
            dir,
            ttl,
            interval,
            state,
        }
    }

    /// 启动后台循环；出错时停止循环并把实例标记为错误
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("临时文件清理启动: {:?}, ttl={:?}, interval={:?}", self.dir, self.ttl, self.interval);
            loop {
                tokio::time::sleep(self.interval).await;
                if !self.state.is_connected() {
                    info!("文件系统已断开，停止临时文件清理");
                    break;
                }
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(removed) => info!("清理了 {} 个过期临时文件", removed),
                    Err(e) => {
                        error!("临时文件清理失败: {}", e);
                        self.state.set(FsState::Error);
                        break;
                    }
                }
            }
        })
    }

    /// 执行一轮清理，返回删除的文件数
    pub async fn sweep(&self) -> Result<usize> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(0);
        }

        let now = SystemTime::now();
        let mut removed = 0;
        let mut pending = vec![self.dir.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let age = now
                    .duration_since(metadata.modified()?)
                    .unwrap_or_default();
                if age > self.ttl {
                    debug!("删除过期临时文件 {:?} (age={:?})", entry.path(), age);
                    match tokio::fs::remove_file(entry.path()).await {
                        Ok(()) => removed += 1,
                        // 已被并发删除
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age_file(path: &std::path::Path, age: Duration) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("leases");
        std::fs::create_dir_all(&nested).unwrap();

        let old = dir.path().join("old.tmp");
        let old_nested = nested.join("old-lease");
        let fresh = dir.path().join("fresh.tmp");
        for path in [&old, &old_nested, &fresh] {
            std::fs::write(path, b"x").unwrap();
        }
        age_file(&old, Duration::from_secs(7200));
        age_file(&old_nested, Duration::from_secs(7200));

        let janitor = TmpJanitor::new(
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            SharedState::new(FsState::Connected),
        );
        assert_eq!(janitor.sweep().await.unwrap(), 2);
        assert!(!old.exists());
        assert!(!old_nested.exists());
        assert!(fresh.exists());
        assert!(nested.exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_dir() {
        let dir = TempDir::new().unwrap();
        let janitor = TmpJanitor::new(
            dir.path().join("absent"),
            Duration::from_secs(1),
            Duration::from_secs(60),
            SharedState::new(FsState::Connected),
        );
        assert_eq!(janitor.sweep().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_stops_when_disconnected() {
        let dir = TempDir::new().unwrap();
        let state = SharedState::new(FsState::Connected);
        let janitor = TmpJanitor::new(
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
            Duration::from_secs(60),
            state.clone(),
        );
        let handle = janitor.spawn();
        state.set(FsState::Closed);
        tokio::time::advance(Duration::from_secs(61)).await;
        handle.await.unwrap();
        assert_eq!(state.get(), FsState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_failure_marks_error() {
        let dir = TempDir::new().unwrap();
        // 临时目录位置被普通文件占用，read_dir 会失败
        let blocked = dir.path().join("not-a-dir");
        std::fs::write(&blocked, b"x").unwrap();

        let state = SharedState::new(FsState::Connected);
        let janitor = TmpJanitor::new(
            blocked,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            state.clone(),
        );
        assert!(janitor.sweep().await.is_err());

        let handle = janitor.spawn();
        tokio::time::advance(Duration::from_secs(61)).await;
        handle.await.unwrap();
        assert_eq!(state.get(), FsState::Error);
    }
}
