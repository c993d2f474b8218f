use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

use crate::error::{FsError, Result};

const GZ_EXTENSION: &str = "gz";

/// gzip 压缩为 `<file>.gz`，返回新文件路径
pub async fn compress(file: &Path) -> Result<PathBuf> {
    let mut name = file
        .file_name()
        .ok_or_else(|| FsError::InvalidPath(format!("{:?}", file)))?
        .to_os_string();
    name.push(".");
    name.push(GZ_EXTENSION);
    let dest = file.with_file_name(name);

    let src = file.to_path_buf();
    let out = dest.clone();
    run_blocking(move || {
        let mut reader = BufReader::new(File::open(&src)?);
        let mut encoder = GzEncoder::new(BufWriter::new(File::create(&out)?), Compression::default());
        std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?.flush()?;
        Ok(())
    })
    .await?;
    debug!("compressed {:?} -> {:?}", file, dest);
    Ok(dest)
}

/// 解压 gzip 文件：去掉 `.gz` 后缀，没有后缀时追加 `.out`
pub async fn decompress(file: &Path) -> Result<PathBuf> {
    let dest = if file.extension().is_some_and(|ext| ext == GZ_EXTENSION) {
        file.with_extension("")
    } else {
        let mut name = file
            .file_name()
            .ok_or_else(|| FsError::InvalidPath(format!("{:?}", file)))?
            .to_os_string();
        name.push(".out");
        file.with_file_name(name)
    };
    gunzip_to(file, &dest).await?;
    debug!("decompressed {:?} -> {:?}", file, dest);
    Ok(dest)
}

/// 解压到指定文件，返回解压后的字节数
pub async fn gunzip_to(src: &Path, dest: &Path) -> Result<u64> {
    let src = src.to_path_buf();
    let dest = dest.to_path_buf();
    run_blocking(move || {
        let mut decoder = GzDecoder::new(BufReader::new(File::open(&src)?));
        let mut writer = BufWriter::new(File::create(&dest)?);
        let written = std::io::copy(&mut decoder, &mut writer)?;
        writer.flush()?;
        Ok(written)
    })
    .await
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> std::io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FsError::Storage(format!("compression task failed: {}", e)))?
        .map_err(FsError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compress_decompress() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("notes.txt");
        let content = "repeat ".repeat(500);
        std::fs::write(&original, &content).unwrap();

        let packed = compress(&original).await.unwrap();
        assert_eq!(packed, dir.path().join("notes.txt.gz"));
        assert!(std::fs::metadata(&packed).unwrap().len() < content.len() as u64);

        std::fs::remove_file(&original).unwrap();
        let unpacked = decompress(&packed).await.unwrap();
        assert_eq!(unpacked, original);
        assert_eq!(std::fs::read_to_string(&unpacked).unwrap(), content);
    }

    #[tokio::test]
    async fn test_decompress_without_suffix() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("blob");
        std::fs::write(&original, b"payload").unwrap();
        let packed = compress(&original).await.unwrap();
        let renamed = dir.path().join("blob.bin");
        std::fs::rename(&packed, &renamed).unwrap();

        let unpacked = decompress(&renamed).await.unwrap();
        assert_eq!(unpacked, dir.path().join("blob.bin.out"));
        assert_eq!(std::fs::read(&unpacked).unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_decompress_garbage_fails() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.gz");
        std::fs::write(&bogus, b"not gzip").unwrap();
        assert!(decompress(&bogus).await.is_err());
    }
}
