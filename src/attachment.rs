//! Image attachments: reading a file into a data URI for preview and raw
//! base64 for the request body.

use crate::error::AttachmentError;
use base64::Engine;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedImage {
    data_uri: String,
}

impl EncodedImage {
    pub fn from_bytes(mime: &str, bytes: &[u8]) -> Self {
        let payload = base64::engine::general_purpose::STANDARD.encode(bytes);
        Self {
            data_uri: format!("data:{};base64,{}", mime, payload),
        }
    }

    pub fn data_uri(&self) -> &str {
        &self.data_uri
    }

    /// Everything after the header's comma.
    pub fn base64_payload(&self) -> &str {
        self.data_uri
            .split_once(',')
            .map(|(_, payload)| payload)
            .unwrap_or_default()
    }
}

pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

/// Reads the whole file without blocking the runtime.
pub async fn encode_file(path: &Path) -> Result<EncodedImage, AttachmentError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|source| AttachmentError::Read {
            path: path.display().to_string(),
            source,
        })?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "image encoded");
    Ok(EncodedImage::from_bytes(mime_for_path(path), &bytes))
}

/// Handle for one selection. A fulfilment carrying an older ticket than the
/// slot's current one is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionTicket(u64);

/// The pending, not-yet-sent image of the input area.
#[derive(Debug, Default)]
pub struct AttachmentSlot {
    generation: u64,
    path: Option<PathBuf>,
    image: Option<EncodedImage>,
}

impl AttachmentSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new selection. Every call counts as new, including a
    /// repeat of the previously selected path.
    pub fn select(&mut self, path: impl Into<PathBuf>) -> SelectionTicket {
        self.generation += 1;
        self.path = Some(path.into());
        self.image = None;
        SelectionTicket(self.generation)
    }

    /// Stores the encoded image if `ticket` is still current.
    pub fn fulfil(&mut self, ticket: SelectionTicket, image: EncodedImage) -> bool {
        if ticket.0 != self.generation || self.path.is_none() {
            return false;
        }
        self.image = Some(image);
        true
    }

    /// Drops preview and path and invalidates outstanding tickets.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.path = None;
        self.image = None;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn image(&self) -> Option<&EncodedImage> {
        self.image.as_ref()
    }

    /// Drops the selection after its encode failed, if `ticket` is still
    /// current. A failure from an older selection leaves the slot alone.
    pub fn fail(&mut self, ticket: SelectionTicket) -> bool {
        if ticket.0 != self.generation {
            return false;
        }
        self.clear();
        true
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_none() && self.image.is_none()
    }
}
