use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

const BUFFER_SIZE: usize = 64 * 1024;

/// Bundles `(source, name-in-archive)` pairs into one deflated zip,
/// streaming each source through a fixed-size buffer.
pub fn compress_multiple_to_zip(source_files: &[(PathBuf, String)], dest_path: &Path) -> Result<u64> {
    debug!("Compressing {} files to {}", source_files.len(), dest_path.display());

    if let Some(parent) = dest_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let dest_file = File::create(dest_path)?;
    let buffered_writer = BufWriter::new(dest_file);
    let mut zip = ZipWriter::new(buffered_writer);

    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(6))
        .large_file(true);

    let mut buffer = vec![0u8; BUFFER_SIZE];

    for (source_path, archive_name) in source_files {
        debug!("Adding {} as {}", source_path.display(), archive_name);
        zip.start_file(archive_name.as_str(), options)?;

        let mut reader = BufReader::new(File::open(source_path)?);
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            zip.write_all(&buffer[..bytes_read])?;
        }
    }

    let mut writer = zip.finish()?;
    writer.flush()?;
    drop(writer);

    let dest_size = std::fs::metadata(dest_path)?.len();
    debug!("Compression complete: {} bytes", dest_size);
    Ok(dest_size)
}

pub fn calculate_sha256(file_path: &Path) -> Result<String> {
    let mut reader = BufReader::new(File::open(file_path)?);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
