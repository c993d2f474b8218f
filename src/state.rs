use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use tracing::warn;

/// FileSystem 实例的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FsState {
    Initializing,
    Connected,
    Error,
    Closed,
}

/// 门面与清理任务共享的状态
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<RwLock<FsState>>,
}

impl SharedState {
    pub fn new(state: FsState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(state)),
        }
    }

    pub fn get(&self) -> FsState {
        *self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set(&self, state: FsState) {
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if *current != state {
            if state == FsState::Error {
                warn!("文件系统状态 {:?} -> {:?}", *current, state);
            }
            *current = state;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get() == FsState::Connected
    }
}
