//! zstd streaming helpers. All of them block and run on the blocking pool.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const COMPRESSION_LEVEL: i32 = 3;

fn join_err(e: tokio::task::JoinError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("compression task failed: {e}"))
}

/// Compress `source` into `dest`, returning the compressed size.
pub async fn compress_file(source: &Path, dest: &Path) -> io::Result<u64> {
    let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let input = BufReader::new(File::open(&source)?);
        let mut output = BufWriter::new(File::create(&dest)?);
        zstd::stream::copy_encode(input, &mut output, COMPRESSION_LEVEL)?;
        output.flush()?;
        let original = std::fs::metadata(&source)?.len();
        let compressed = std::fs::metadata(&dest)?.len();
        debug!(
            "Compressed {} ({}B -> {}B)",
            source.display(),
            original,
            compressed
        );
        Ok(compressed)
    })
    .await
    .map_err(join_err)?
}

pub async fn decompress_file(source: &Path, dest: &Path) -> io::Result<u64> {
    let (source, dest) = (source.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let input = BufReader::new(File::open(&source)?);
        let mut output = BufWriter::new(File::create(&dest)?);
        zstd::stream::copy_decode(input, &mut output)?;
        output.flush()?;
        Ok(std::fs::metadata(&dest)?.len())
    })
    .await
    .map_err(join_err)?
}

/// Decode a whole zstd stream without keeping the output. Fails on truncated
/// or foreign data, and when the decoded stream does not start with
/// `expected_header`. Returns the decoded size.
pub async fn verify_stream(source: &Path, expected_header: Option<&'static [u8]>) -> io::Result<u64> {
    let source: PathBuf = source.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut decoder = zstd::stream::read::Decoder::new(File::open(&source)?)?;
        let mut decoded = 0u64;

        if let Some(expected) = expected_header {
            let mut header = vec![0u8; expected.len()];
            decoder.read_exact(&mut header)?;
            if header != expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "decoded data has an unexpected header",
                ));
            }
            decoded += header.len() as u64;
        }

        decoded += io::copy(&mut decoder, &mut io::sink())?;
        Ok(decoded)
    })
    .await
    .map_err(join_err)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compress_verify_decompress() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("dump.sql");
        std::fs::write(&plain, "CREATE TABLE orders (id serial);\n".repeat(100)).unwrap();

        let packed = dir.path().join("dump.sql.zst");
        compress_file(&plain, &packed).await.unwrap();

        let decoded = verify_stream(&packed, Some(b"CREATE")).await.unwrap();
        assert_eq!(decoded, std::fs::metadata(&plain).unwrap().len());

        let unpacked = dir.path().join("restored.sql");
        decompress_file(&packed, &unpacked).await.unwrap();
        assert_eq!(
            std::fs::read(&plain).unwrap(),
            std::fs::read(&unpacked).unwrap()
        );
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_header_and_garbage() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("data");
        std::fs::write(&plain, b"not a database file at all").unwrap();
        let packed = dir.path().join("data.zst");
        compress_file(&plain, &packed).await.unwrap();
        assert!(verify_stream(&packed, Some(b"SQLite format 3\0")).await.is_err());

        let garbage = dir.path().join("garbage.zst");
        std::fs::write(&garbage, b"this was never compressed").unwrap();
        assert!(verify_stream(&garbage, None).await.is_err());
    }

    #[tokio::test]
    async fn test_verify_rejects_truncated_stream() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("big");
        let content: Vec<u8> = (0..200_000u32).flat_map(|n| n.to_le_bytes()).collect();
        std::fs::write(&plain, &content).unwrap();
        let packed = dir.path().join("big.zst");
        compress_file(&plain, &packed).await.unwrap();

        let bytes = std::fs::read(&packed).unwrap();
        std::fs::write(&packed, &bytes[..bytes.len() / 2]).unwrap();
        assert!(verify_stream(&packed, None).await.is_err());
    }
}
