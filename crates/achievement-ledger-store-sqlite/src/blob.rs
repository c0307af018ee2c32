//! Filesystem-backed attachment storage.

use std::path::{Path, PathBuf};

use achievement_ledger_core::{AttachmentBlobStore, StoredBlob};
use anyhow::{anyhow, Context, Result};
use ulid::Ulid;

const URL_PREFIX: &str = "/uploads";

pub struct FsAttachmentStore {
    root: PathBuf,
}

impl FsAttachmentStore {
    #[must_use]
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AttachmentBlobStore for FsAttachmentStore {
    fn put(&self, file_name: &str, bytes: &[u8]) -> Result<StoredBlob> {
        let safe_name = sanitize_file_name(file_name)?;
        std::fs::create_dir_all(&self.root).with_context(|| {
            format!("failed to create upload directory {}", self.root.display())
        })?;

        let stored_name = format!("{}_{safe_name}", Ulid::new());
        let path = self.root.join(&stored_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write attachment {}", path.display()))?;

        tracing::debug!(path = %path.display(), size = bytes.len(), "attachment stored");
        Ok(StoredBlob {
            url: format!("{URL_PREFIX}/{stored_name}"),
            content_type: content_type_for(file_name).to_string(),
        })
    }
}

/// MIME type chosen from the file extension.
#[must_use]
pub fn content_type_for(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

/// Keeps the last path component and replaces anything outside `[A-Za-z0-9._-]`.
fn sanitize_file_name(file_name: &str) -> Result<String> {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    let cleaned: String = base
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        return Err(anyhow!("attachment file name `{file_name}` is not usable"));
    }
    Ok(cleaned)
}
