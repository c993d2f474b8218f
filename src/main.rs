use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use metavfs::{FileSystem, FsConfig, FsEnv, Inode, InodeReader, MemoryCoordinator, PathInfo};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "多租户虚拟文件系统元数据工具", long_about = None)]
struct Args {
    /// 配置文件（JSON）
    #[arg(short, long)]
    config: PathBuf,

    /// 协调树快照文件，不存在时从空树开始
    #[arg(short, long, default_value = "metavfs-state.json")]
    state: PathBuf,

    /// 容器名，缺省使用默认容器
    #[arg(short, long)]
    domain: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 创建目录（含父目录）
    Mkdirs { path: String },
    /// 上传本地文件
    Put { local: PathBuf, path: String },
    /// 输出文件内容
    Cat { path: String },
    /// 显示 inode 记录
    Stat { path: String },
    /// 列出目录
    Ls {
        #[arg(default_value = "/")]
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
    /// 按正则查找文件
    Find {
        path: String,
        file_regex: String,
        #[arg(long)]
        dir_regex: Option<String>,
    },
    /// 删除
    Rm {
        path: String,
        #[arg(short, long)]
        recursive: bool,
    },
}

fn print_entry(inode: &Inode) {
    let size = inode.file_data().map(|d| d.size).unwrap_or(0);
    println!(
        "{:<9} {:>10}  {}  {}",
        format!("{:?}", inode.inode_type()).to_lowercase(),
        size,
        inode.update_timestamp.format("%Y-%m-%d %H:%M:%S"),
        inode.absolute_path
    );
}

/// 读出全部内容
async fn read_all(reader: &mut dyn InodeReader) -> Result<Vec<u8>> {
    reader.open().await?;
    let mut buf = vec![0u8; 64 * 1024];
    let len = buf.len();
    let mut out = Vec::new();
    loop {
        let n = reader.read(&mut buf, 0, len).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    reader.close().await?;
    Ok(out)
}

async fn run(fs: &FileSystem, domain: &str, command: Command) -> Result<()> {
    match command {
        Command::Mkdirs { path } => {
            let dir = fs.mkdirs(domain, &path).await?;
            print_entry(&dir);
        }
        Command::Put { local, path } => {
            let bytes = tokio::fs::read(&local)
                .await
                .with_context(|| format!("读取本地文件失败: {:?}", local))?;
            let inode = fs.create(domain, &path).await?;
            let mut writer = fs.writer(&inode)?;
            writer.open(true).await?;
            writer.write(&bytes, 0, bytes.len()).await?;
            writer.flush().await?;
            writer.close().await?;

            let mut updated = inode.clone();
            if let Some(data) = updated.file_data_mut() {
                data.size = bytes.len() as u64;
                data.state = metavfs::FileState::Updated;
            }
            let updated = fs.update(&updated).await?;
            print_entry(&updated);
        }
        Command::Cat { path } => {
            let mut reader = fs.reader_at(&PathInfo::new(domain, &path)).await?;
            let out = read_all(reader.as_mut()).await?;
            print!("{}", String::from_utf8_lossy(&out));
        }
        Command::Stat { path } => {
            let inode = fs.get(&PathInfo::new(domain, &path)).await?;
            println!("{}", serde_json::to_string_pretty(&inode)?);
        }
        Command::Ls { path, recursive } => {
            for inode in fs.list(&PathInfo::new(domain, &path), recursive).await? {
                print_entry(&inode);
            }
        }
        Command::Find {
            path,
            file_regex,
            dir_regex,
        } => {
            let found = fs
                .find(&PathInfo::new(domain, &path), dir_regex.as_deref(), &file_regex)
                .await?;
            for inode in found {
                print_entry(&inode);
            }
        }
        Command::Rm { path, recursive } => {
            fs.delete(&PathInfo::new(domain, &path), recursive).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志系统
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let text = tokio::fs::read_to_string(&args.config)
        .await
        .with_context(|| format!("读取配置失败: {:?}", args.config))?;
    let mut config = FsConfig::from_json(&text)?;
    // 命令行工具是一次性进程，不需要后台清理
    config.cleanup_enabled = false;

    let coordinator = MemoryCoordinator::load_snapshot(&args.state)?;
    let fs = FileSystem::init(config, FsEnv::new(Arc::new(coordinator.clone()))).await?;
    let domain = args
        .domain
        .unwrap_or_else(|| fs.default_domain().to_string());
    if !fs.domains().iter().any(|d| d.name == domain) {
        return Err(anyhow!("未知容器: {}", domain));
    }

    let result = run(&fs, &domain, args.command).await;
    fs.close();
    coordinator.save_snapshot(&args.state)?;
    info!("快照已写回 {:?}", args.state);
    result
}
