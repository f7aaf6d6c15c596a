//! Enrollment reference photos.
//!
//! Photos arrive as `data:image/<ext>;base64,...` URLs. They are written to
//! the upload directory and referenced as `/uploads/<file>`. When the
//! directory cannot be written (read-only or permission denied) or inline
//! mode is on, the data URL itself is stored instead.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub const URL_PREFIX: &str = "/uploads/";

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("invalid face photo format")]
    InvalidFormat,
    #[error("face photo is {actual} bytes, limit is {limit}")]
    TooLarge { actual: usize, limit: usize },
    #[error("failed to store face photo: {0}")]
    Io(#[from] std::io::Error),
}

/// A decoded data-URL image.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    /// File extension: `png`, `jpg` or `webp`.
    pub ext: &'static str,
    pub bytes: Vec<u8>,
}

/// Parse and decode a data URL, enforcing the decoded size cap.
pub fn decode_data_url(data_url: &str, max_bytes: usize) -> Result<DecodedImage, PhotoError> {
    let rest = data_url
        .strip_prefix("data:image/")
        .ok_or(PhotoError::InvalidFormat)?;
    let (kind, payload) = rest.split_once(";base64,").ok_or(PhotoError::InvalidFormat)?;
    let ext = match kind {
        "png" => "png",
        "jpeg" | "jpg" => "jpg",
        "webp" => "webp",
        _ => return Err(PhotoError::InvalidFormat),
    };
    if payload.is_empty() {
        return Err(PhotoError::InvalidFormat);
    }

    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| PhotoError::InvalidFormat)?;
    if bytes.len() > max_bytes {
        return Err(PhotoError::TooLarge {
            actual: bytes.len(),
            limit: max_bytes,
        });
    }
    Ok(DecodedImage { ext, bytes })
}

/// Writes enrollment photos under one directory.
#[derive(Debug, Clone)]
pub struct PhotoStore {
    dir: PathBuf,
    inline: bool,
}

impl PhotoStore {
    pub fn new(dir: impl Into<PathBuf>, inline: bool) -> Self {
        Self {
            dir: dir.into(),
            inline,
        }
    }

    /// Persist a decoded photo and return the URL to store for it.
    pub async fn save(&self, image: &DecodedImage, data_url: &str) -> Result<String, PhotoError> {
        if self.inline {
            return Ok(data_url.to_string());
        }

        match self.write_file(image).await {
            Ok(name) => Ok(format!("{URL_PREFIX}{name}")),
            Err(e) if is_unwritable(&e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "upload dir not writable; storing photo inline");
                Ok(data_url.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(&self, image: &DecodedImage) -> std::io::Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let name = format!("{millis}-{}.{}", uuid::Uuid::new_v4(), image.ext);
        tokio::fs::write(self.dir.join(&name), &image.bytes).await?;
        tracing::debug!(file = %name, bytes = image.bytes.len(), "face photo written");
        Ok(name)
    }

    /// Path of a served file, or `None` for names that could escape the
    /// upload directory.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let safe = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        safe.then(|| self.dir.join(name))
    }
}

pub fn content_type(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn is_unwritable(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EROFS) | Some(libc::EACCES))
}
