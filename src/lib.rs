pub mod backend;
pub mod compress;
pub mod config;
pub mod coordination;
pub mod error;
pub mod fs;
pub mod inode;
pub mod janitor;
pub mod lease;
pub mod lock;
pub mod path;
pub mod registry;
pub mod state;
pub mod store;

pub use backend::{Backend, BackendRegistry, InodeReader, InodeWriter, LocalBackend};
pub use config::{BackendConfig, ContainerConfig, FsConfig};
pub use coordination::{CoordinationClient, CoordinationMutex, MemoryCoordinator};
pub use error::{CoordinationError, FsError, Result};
pub use fs::{FileSystem, FsEnv};
pub use inode::{Domain, FileData, FileLease, FileState, Inode, InodeKind, InodeType, PathInfo};
pub use state::FsState;
