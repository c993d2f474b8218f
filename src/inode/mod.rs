use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InodeType {
    Directory,
    File,
    Archive,
    Temp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    New,
    Synced,
    Updated,
    Deleted,
    Archived,
}

impl FileState {
    /// 内容尚未同步到后端（新建或已修改）
    pub fn is_pending_update(self) -> bool {
        matches!(self, FileState::New | FileState::Updated)
    }
}

/// 文件签出租约
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLease {
    /// 持有者 FileSystem 实例的身份
    pub client_id: String,
    /// 本地签出文件
    pub local_path: Option<PathBuf>,
    pub time_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub size: u64,
    pub state: FileState,
    pub compressed: bool,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub lease: Option<FileLease>,
}

impl FileData {
    pub fn new() -> Self {
        Self {
            size: 0,
            state: FileState::New,
            compressed: false,
            mime_type: None,
            lease: None,
        }
    }
}

impl Default for FileData {
    fn default() -> Self {
        Self::new()
    }
}

/// 各类 inode 的专有字段，序列化时以 `type` 字段区分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InodeKind {
    /// 子节点由协调树的子节点列表隐式给出
    Directory,
    File(FileData),
    Archive(FileData),
    Temp,
}

/// 命名空间中一个条目的元数据记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub name: String,
    pub domain: String,
    pub absolute_path: String,
    /// 协调树中的唯一键，由域根路径和路径段确定
    pub coordination_path: String,
    pub uuid: Uuid,
    pub create_timestamp: DateTime<Utc>,
    pub update_timestamp: DateTime<Utc>,
    pub synced: bool,
    /// 父节点的协调路径，按需重新查找，不持有父节点
    #[serde(default)]
    pub parent: Option<String>,
    /// 后端相关的路径配置，本层只负责透传
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_config: Option<serde_json::Value>,
    #[serde(flatten)]
    pub kind: InodeKind,
}

impl Inode {
    fn with_kind(
        kind: InodeKind,
        name: &str,
        domain: &str,
        absolute_path: &str,
        coordination_path: &str,
        parent: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            domain: domain.to_string(),
            absolute_path: absolute_path.to_string(),
            coordination_path: coordination_path.to_string(),
            uuid: Uuid::new_v4(),
            create_timestamp: now,
            update_timestamp: now,
            synced: true,
            parent,
            path_config: None,
            kind,
        }
    }

    pub fn new_directory(
        name: &str,
        domain: &str,
        absolute_path: &str,
        coordination_path: &str,
        parent: Option<String>,
    ) -> Self {
        Self::with_kind(
            InodeKind::Directory,
            name,
            domain,
            absolute_path,
            coordination_path,
            parent,
        )
    }

    pub fn new_file(
        name: &str,
        domain: &str,
        absolute_path: &str,
        coordination_path: &str,
        parent: Option<String>,
    ) -> Self {
        Self::with_kind(
            InodeKind::File(FileData::new()),
            name,
            domain,
            absolute_path,
            coordination_path,
            parent,
        )
    }

    pub fn new_archive(
        name: &str,
        domain: &str,
        absolute_path: &str,
        coordination_path: &str,
        parent: Option<String>,
    ) -> Self {
        let mut data = FileData::new();
        data.state = FileState::Archived;
        Self::with_kind(
            InodeKind::Archive(data),
            name,
            domain,
            absolute_path,
            coordination_path,
            parent,
        )
    }

    pub fn inode_type(&self) -> InodeType {
        match self.kind {
            InodeKind::Directory => InodeType::Directory,
            InodeKind::File(_) => InodeType::File,
            InodeKind::Archive(_) => InodeType::Archive,
            InodeKind::Temp => InodeType::Temp,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.inode_type() == InodeType::Directory
    }

    pub fn is_file(&self) -> bool {
        self.inode_type() == InodeType::File
    }

    pub fn is_archive(&self) -> bool {
        self.inode_type() == InodeType::Archive
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// 文件或归档的专有字段
    pub fn file_data(&self) -> Option<&FileData> {
        match &self.kind {
            InodeKind::File(data) | InodeKind::Archive(data) => Some(data),
            _ => None,
        }
    }

    pub fn file_data_mut(&mut self) -> Option<&mut FileData> {
        match &mut self.kind {
            InodeKind::File(data) | InodeKind::Archive(data) => Some(data),
            _ => None,
        }
    }

    pub fn require_file_data(&self) -> Result<&FileData> {
        self.file_data()
            .ok_or_else(|| FsError::InvalidOperation(format!("not a file: {}", self.absolute_path)))
    }

    pub fn require_file_data_mut(&mut self) -> Result<&mut FileData> {
        let path = self.absolute_path.clone();
        self.file_data_mut()
            .ok_or_else(|| FsError::InvalidOperation(format!("not a file: {}", path)))
    }

    pub fn lease(&self) -> Option<&FileLease> {
        self.file_data().and_then(|data| data.lease.as_ref())
    }

    /// 父目录的绝对路径
    pub fn parent_absolute_path(&self) -> &str {
        match self.absolute_path.rsplit_once('/') {
            Some(("", _)) => "/",
            Some((parent, _)) => parent,
            None => "",
        }
    }

    /// 指向本 inode 的路径信息
    pub fn path_info(&self) -> PathInfo {
        PathInfo {
            domain: Some(self.domain.clone()),
            path: self.absolute_path.clone(),
            path_config: self.path_config.clone(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// 容器（租户）描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub root_absolute_path: String,
    pub is_default: bool,
}

/// 调用方给出的路径：域、逻辑路径以及透传给持久化层的后端配置
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathInfo {
    /// 缺省时使用默认容器
    pub domain: Option<String>,
    pub path: String,
    #[serde(default)]
    pub path_config: Option<serde_json::Value>,
}

impl PathInfo {
    pub fn new(domain: &str, path: &str) -> Self {
        Self {
            domain: Some(domain.to_string()),
            path: path.to_string(),
            path_config: None,
        }
    }

    /// 使用默认容器
    pub fn in_default(path: &str) -> Self {
        Self {
            domain: None,
            path: path.to_string(),
            path_config: None,
        }
    }

    pub fn with_config(mut self, path_config: serde_json::Value) -> Self {
        self.path_config = Some(path_config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let mut inode = Inode::new_file("c.txt", "docs", "/docs/a/c.txt", "/vfs/docs/a/c.txt", Some("/vfs/docs/a".to_string()));
        inode.require_file_data_mut().unwrap().lease = Some(FileLease {
            client_id: "X".to_string(),
            local_path: Some(PathBuf::from("/tmp/x")),
            time_updated: Utc::now(),
        });

        let value: serde_json::Value = serde_json::from_slice(&inode.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "file");
        assert_eq!(value["state"], "new");
        assert_eq!(value["parent"], "/vfs/docs/a");
        assert_eq!(value["lease"]["client_id"], "X");
        assert!(value.get("path_config").is_none());

        let decoded = Inode::from_bytes(&inode.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, inode);
    }

    #[test]
    fn test_directory_record() {
        let dir = Inode::new_directory("a", "docs", "/docs/a", "/vfs/docs/a", None);
        let value: serde_json::Value = serde_json::from_slice(&dir.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "directory");
        assert!(dir.is_directory());
        assert!(dir.is_root());
        assert!(dir.file_data().is_none());
        assert!(dir.require_file_data().is_err());
    }

    #[test]
    fn test_parent_absolute_path() {
        let file = Inode::new_file("c.txt", "docs", "/docs/a/c.txt", "/vfs/docs/a/c.txt", None);
        assert_eq!(file.parent_absolute_path(), "/docs/a");
        let top = Inode::new_directory("docs", "docs", "/docs", "/vfs/docs", None);
        assert_eq!(top.parent_absolute_path(), "/");
    }

    #[test]
    fn test_pending_update_states() {
        assert!(FileState::New.is_pending_update());
        assert!(FileState::Updated.is_pending_update());
        assert!(!FileState::Synced.is_pending_update());
        assert!(!FileState::Deleted.is_pending_update());
    }
}
