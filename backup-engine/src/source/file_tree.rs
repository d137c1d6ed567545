//! StateSource over a directory of uploaded artifacts.
//!
//! Export walks the tree in sorted order and packs it into a tar segment
//! with normalized headers, so two exports of an unchanged tree produce
//! byte-identical output and therefore equal checksums. Swap is a single
//! directory rename.

use super::{path_with_suffix, PreSwapRef, StagingHandle, StateSource};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub struct FileTreeSource {
    name: String,
    root: PathBuf,
}

impl FileTreeSource {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
        }
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn pack_tree(root: &Path, dest: &Path) -> anyhow::Result<u64> {
    let file = std::fs::File::create(dest)?;
    let mut builder = tar::Builder::new(std::io::BufWriter::new(file));
    let mut count = 0u64;

    if root.exists() {
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry.path().strip_prefix(root)?;
            let meta = entry.metadata()?;

            // Normalized header: only path, size and mtime vary, so the
            // segment is reproducible for an unchanged tree.
            let mut header = tar::Header::new_gnu();
            header.set_size(meta.len());
            header.set_mode(0o644);
            header.set_mtime(mtime_secs(&meta));
            header.set_cksum();

            let mut f = std::fs::File::open(entry.path())?;
            builder.append_data(&mut header, rel, &mut f)?;
            count += 1;
        }
    }

    builder.into_inner()?.flush()?;
    Ok(count)
}

fn unpack_tree(segment: &Path, staging: &Path) -> anyhow::Result<()> {
    if staging.exists() {
        std::fs::remove_dir_all(staging)?;
    }
    std::fs::create_dir_all(staging)?;
    let file = std::fs::File::open(segment)?;
    let mut archive = tar::Archive::new(std::io::BufReader::new(file));
    // mtimes are preserved on unpack so a post-restore re-export matches
    // the original manifest checksums.
    archive.unpack(staging)?;
    Ok(())
}

#[async_trait]
impl StateSource for FileTreeSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn export(&self, dest: &Path) -> anyhow::Result<u64> {
        let root = self.root.clone();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || pack_tree(&root, &dest)).await?
    }

    async fn stage(&self, export: &Path) -> anyhow::Result<StagingHandle> {
        let staging = path_with_suffix(&self.root, ".staging");
        let export = export.to_path_buf();
        let staging2 = staging.clone();
        tokio::task::spawn_blocking(move || unpack_tree(&export, &staging2)).await??;
        Ok(StagingHandle {
            source_name: self.name.clone(),
            path: staging,
        })
    }

    async fn swap(&self, staged: &StagingHandle) -> anyhow::Result<PreSwapRef> {
        let root = self.root.clone();
        let staged_path = staged.path.clone();
        let name = self.name.clone();
        tokio::task::spawn_blocking(move || {
            let pre = path_with_suffix(&root, ".pre-swap");
            if pre.exists() {
                std::fs::remove_dir_all(&pre)?;
            }
            let existed = root.exists();
            if existed {
                std::fs::rename(&root, &pre)?;
            }
            std::fs::rename(&staged_path, &root)?;
            Ok(PreSwapRef {
                source_name: name,
                path: pre,
                existed,
            })
        })
        .await?
    }

    async fn rollback_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        let root = self.root.clone();
        let pre = pre.clone();
        tokio::task::spawn_blocking(move || {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            if pre.existed {
                std::fs::rename(&pre.path, &root)?;
            }
            Ok(())
        })
        .await?
    }

    async fn discard_staged(&self, staged: &StagingHandle) -> anyhow::Result<()> {
        let path = staged.path.clone();
        tokio::task::spawn_blocking(move || {
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            Ok(())
        })
        .await?
    }

    async fn discard_pre_swap(&self, pre: &PreSwapRef) -> anyhow::Result<()> {
        let path = pre.path.clone();
        tokio::task::spawn_blocking(move || {
            if path.exists() {
                std::fs::remove_dir_all(&path)?;
            }
            Ok(())
        })
        .await?
    }
}
