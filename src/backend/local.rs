use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, error};

use super::{content_path, Backend, InodeReader, InodeWriter};
use crate::compress;
use crate::config::BackendConfig;
use crate::error::{FsError, Result};
use crate::inode::Inode;

/// 本地磁盘后端，内容放在 `root/<domain>/<absolute_path>`
#[derive(Debug, Clone)]
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub const KIND: &'static str = "local";

    pub fn new(root: PathBuf) -> Self {
        Self { base_path: root }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        Ok(Arc::new(Self::new(config.root.clone())))
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn writer(&self, inode: &Inode) -> Result<Box<dyn InodeWriter>> {
        inode.require_file_data()?;
        Ok(Box::new(LocalWriter {
            path: content_path(&self.base_path, inode),
            file: None,
        }))
    }

    fn reader(&self, inode: &Inode) -> Result<Box<dyn InodeReader>> {
        let data = inode.require_file_data()?;
        Ok(Box::new(LocalReader {
            path: content_path(&self.base_path, inode),
            compressed: data.compressed,
            file: None,
        }))
    }
}

fn not_open(path: &Path) -> FsError {
    FsError::InvalidOperation(format!("{:?} is not open", path))
}

fn slice_bounds(len: usize, offset: usize, length: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(length) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(FsError::InvalidOperation(format!(
            "range {}+{} exceeds buffer of {}",
            offset, length, len
        ))),
    }
}

struct LocalWriter {
    path: PathBuf,
    file: Option<File>,
}

#[async_trait]
impl InodeWriter for LocalWriter {
    async fn open(&mut self, overwrite: bool) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                error!("open: failed to create parent directory {:?}: {:?}", parent, e);
                FsError::Io(e)
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(overwrite)
            .append(!overwrite)
            .open(&self.path)
            .await?;
        debug!("open writer: {:?}, overwrite={}", self.path, overwrite);
        self.file = Some(file);
        Ok(())
    }

    async fn write(&mut self, buf: &[u8], offset: usize, length: usize) -> Result<()> {
        let range = slice_bounds(buf.len(), offset, length)?;
        let file = self.file.as_mut().ok_or_else(|| not_open(&self.path))?;
        file.write_all(&buf[range]).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| not_open(&self.path))?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn truncate(&mut self, offset: u64, length: u64) -> Result<()> {
        let end = offset.checked_add(length).ok_or_else(|| {
            FsError::InvalidOperation(format!("length {}+{} overflows", offset, length))
        })?;
        let file = self.file.as_mut().ok_or_else(|| not_open(&self.path))?;
        file.set_len(end).await?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            debug!("close writer: {:?}", self.path);
        }
        Ok(())
    }
}

struct LocalReader {
    path: PathBuf,
    compressed: bool,
    file: Option<File>,
}

#[async_trait]
impl InodeReader for LocalReader {
    async fn open(&mut self) -> Result<()> {
        let file = File::open(&self.path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NotFound(format!("content of {:?}", self.path))
            } else {
                FsError::Io(e)
            }
        })?;
        self.file = Some(file);
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], offset: usize, length: usize) -> Result<usize> {
        let range = slice_bounds(buf.len(), offset, length)?;
        let file = self.file.as_mut().ok_or_else(|| not_open(&self.path))?;
        Ok(file.read(&mut buf[range]).await?)
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        let file = self.file.as_mut().ok_or_else(|| not_open(&self.path))?;
        file.seek(SeekFrom::Start(position)).await?;
        Ok(())
    }

    async fn copy(&mut self, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if self.compressed {
            return compress::gunzip_to(&self.path, dest).await;
        }
        Ok(tokio::fs::copy(&self.path, dest).await?)
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    async fn close(&mut self) -> Result<()> {
        self.file = None;
        Ok(())
    }
}
