use std::collections::HashMap;

use crate::coordination::{join_path, LOCK_NODE};
use crate::error::{FsError, Result};
use crate::inode::{Domain, PathInfo};

/// 一个容器的根：绝对路径与协调路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRoot {
    pub domain: Domain,
    pub coordination_path: String,
}

/// 解析后的路径：容器根加上逐段的路径名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPath {
    pub domain: String,
    root_absolute_path: String,
    root_coordination_path: String,
    pub segments: Vec<String>,
}

impl ResolvedPath {
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn name(&self) -> &str {
        self.segments
            .last()
            .map(String::as_str)
            .unwrap_or(self.root_absolute_path.as_str())
    }

    /// 前 `depth` 段对应的协调路径，0 为容器根
    pub fn coordination_path_at(&self, depth: usize) -> String {
        self.segments[..depth]
            .iter()
            .fold(self.root_coordination_path.clone(), |acc, segment| {
                join_path(&acc, segment)
            })
    }

    /// 前 `depth` 段对应的绝对路径，0 为容器根
    pub fn absolute_path_at(&self, depth: usize) -> String {
        self.segments[..depth]
            .iter()
            .fold(self.root_absolute_path.clone(), |acc, segment| {
                join_path(&acc, segment)
            })
    }

    pub fn coordination_path(&self) -> String {
        self.coordination_path_at(self.depth())
    }

    pub fn absolute_path(&self) -> String {
        self.absolute_path_at(self.depth())
    }

    /// 父节点的协调路径，容器根返回 `None`
    pub fn parent_coordination_path(&self) -> Option<String> {
        if self.is_root() {
            None
        } else {
            Some(self.coordination_path_at(self.depth() - 1))
        }
    }
}

/// 把 (域, 逻辑路径) 映射到协调路径和容器内绝对路径
///
/// 映射只依赖容器根和路径段，任何进程对同一逻辑路径都会算出同一个协调路径。
#[derive(Debug, Clone)]
pub struct PathResolver {
    roots: HashMap<String, DomainRoot>,
    default_domain: String,
}

impl PathResolver {
    pub fn new(roots: HashMap<String, DomainRoot>, default_domain: &str) -> Result<Self> {
        if !roots.contains_key(default_domain) {
            return Err(FsError::Configuration(format!(
                "default container {} has no root",
                default_domain
            )));
        }
        Ok(Self {
            roots,
            default_domain: default_domain.to_string(),
        })
    }

    pub fn default_domain(&self) -> &str {
        &self.default_domain
    }

    pub fn root(&self, domain: &str) -> Result<&DomainRoot> {
        self.roots
            .get(domain)
            .ok_or_else(|| FsError::NotFound(format!("domain {}", domain)))
    }

    pub fn domains(&self) -> impl Iterator<Item = &Domain> {
        self.roots.values().map(|root| &root.domain)
    }

    pub fn resolve(&self, info: &PathInfo) -> Result<ResolvedPath> {
        let domain = info.domain.as_deref().unwrap_or(&self.default_domain);
        let root = self.root(domain)?;
        let root_abs = root.domain.root_absolute_path.as_str();

        // 去掉容器根前缀
        let relative = if root_abs == "/" {
            info.path.as_str()
        } else if info.path == root_abs {
            ""
        } else {
            info.path
                .strip_prefix(root_abs)
                .filter(|rest| rest.starts_with('/'))
                .unwrap_or(info.path.as_str())
        };

        let mut segments = Vec::new();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment == LOCK_NODE {
                return Err(FsError::InvalidPath(format!(
                    "illegal segment {:?} in {}",
                    segment, info.path
                )));
            }
            segments.push(segment.to_string());
        }

        Ok(ResolvedPath {
            domain: domain.to_string(),
            root_absolute_path: root_abs.to_string(),
            root_coordination_path: root.coordination_path.clone(),
            segments,
        })
    }

    /// 父目录下子条目的路径信息
    pub fn child_info(parent_absolute_path: &str, domain: &str, name: &str) -> PathInfo {
        PathInfo::new(domain, &join_path(parent_absolute_path, name))
    }
}
