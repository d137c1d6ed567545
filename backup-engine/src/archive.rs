//! Backup archive packaging.
//!
//! An archive is a zstd-compressed tar. The first entry is
//! `manifest.json` (the ordered source manifest); each source's exported
//! bytes follow under `sources/<source_name>`. Packing streams spool
//! files through the encoder, so archive size is never bounded by
//! memory. All functions here are blocking and are called through
//! `spawn_blocking`.

use crate::source::SourceManifestEntry;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const MANIFEST_ENTRY: &str = "manifest.json";
const SOURCE_PREFIX: &str = "sources/";

fn entry_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    header
}

/// Packs the manifest plus one spool file per source into `dest`.
/// Returns the final archive size in bytes.
pub fn pack(
    dest: &Path,
    manifest: &[SourceManifestEntry],
    spools: &[(String, PathBuf)],
) -> anyhow::Result<u64> {
    let file = std::fs::File::create(dest)?;
    let encoder = zstd::Encoder::new(std::io::BufWriter::new(file), 0)?;
    let mut builder = tar::Builder::new(encoder);

    let manifest_json = serde_json::to_vec_pretty(manifest)?;
    let mut header = entry_header(manifest_json.len() as u64);
    builder.append_data(&mut header, MANIFEST_ENTRY, manifest_json.as_slice())?;

    for (source_name, spool) in spools {
        let mut f = std::fs::File::open(spool)?;
        let mut header = entry_header(f.metadata()?.len());
        builder.append_data(
            &mut header,
            format!("{SOURCE_PREFIX}{source_name}"),
            &mut f,
        )?;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Reads the manifest without extracting any source segment.
pub fn read_manifest(archive: &Path) -> anyhow::Result<Vec<SourceManifestEntry>> {
    let file = std::fs::File::open(archive)?;
    let decoder = zstd::Decoder::new(std::io::BufReader::new(file))?;
    let mut reader = tar::Archive::new(decoder);

    for entry in reader.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_os_str() == MANIFEST_ENTRY {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            return Ok(serde_json::from_slice(&buf)?);
        }
    }
    anyhow::bail!("archive has no manifest entry")
}

/// Extracts every source segment into `out_dir/<source_name>` and returns
/// the manifest. Segment file names are taken from the manifest, never
/// from archive paths, so a crafted entry cannot escape `out_dir`.
pub fn unpack(
    archive: &Path,
    out_dir: &Path,
) -> anyhow::Result<(Vec<SourceManifestEntry>, Vec<(String, PathBuf)>)> {
    std::fs::create_dir_all(out_dir)?;
    let file = std::fs::File::open(archive)?;
    let decoder = zstd::Decoder::new(std::io::BufReader::new(file))?;
    let mut reader = tar::Archive::new(decoder);

    let mut manifest: Option<Vec<SourceManifestEntry>> = None;
    let mut segments: Vec<(String, PathBuf)> = Vec::new();

    for entry in reader.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if path.as_os_str() == MANIFEST_ENTRY {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            manifest = Some(serde_json::from_slice(&buf)?);
            continue;
        }
        let Some(name) = path
            .to_str()
            .and_then(|p| p.strip_prefix(SOURCE_PREFIX))
            .filter(|n| !n.is_empty() && !n.contains('/') && !n.contains('\\'))
        else {
            anyhow::bail!("unexpected archive entry: {}", path.display());
        };
        let dest = out_dir.join(name);
        let mut out = std::fs::File::create(&dest)?;
        std::io::copy(&mut entry, &mut out)?;
        segments.push((name.to_string(), dest));
    }

    let manifest = manifest.ok_or_else(|| anyhow::anyhow!("archive has no manifest entry"))?;
    Ok((manifest, segments))
}

/// Hex-encoded SHA-256 of a file, streamed in chunks.
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
