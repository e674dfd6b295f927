/*
 * upload.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Locanda, an embeddable HTTP server library.
 *
 * Locanda is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Locanda is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Locanda.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Upload streaming: one temp file per body part, written as bytes arrive,
//! finalized with size and path on the closing boundary. The handler
//! receives the finished `UploadPart`s and owns their lifetime, including
//! deletion. Failures mid-stream abort and remove the partial file.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::protocol::http::multipart::PartHead;

#[derive(Debug)]
pub enum UploadError {
    Io(io::Error),
    /// Part exceeded `max_part_bytes` → 413.
    PartTooLarge,
    /// Whole body exceeded `max_upload_bytes` → 413.
    BodyTooLarge,
}

impl UploadError {
    pub fn status(&self) -> u16 {
        match self {
            UploadError::Io(_) => 500,
            UploadError::PartTooLarge | UploadError::BodyTooLarge => 413,
        }
    }
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Io(e) => write!(f, "upload I/O failure: {}", e),
            UploadError::PartTooLarge => f.write_str("upload part too large"),
            UploadError::BodyTooLarge => f.write_str("upload body too large"),
        }
    }
}

impl std::error::Error for UploadError {}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        UploadError::Io(e)
    }
}

/// One finished upload part. The file stays on disk until the owner deletes
/// it (or the server sweeps leftovers at shutdown).
#[derive(Debug)]
pub struct UploadPart {
    path: PathBuf,
    size: u64,
    field_name: String,
    file_name: Option<String>,
    content_type: Option<String>,
}

impl UploadPart {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Read the whole part back. Intended for small parts (form fields).
    pub async fn read(&self) -> io::Result<Vec<u8>> {
        fs::read(&self.path).await
    }

    /// Remove the temp file. The part is spent afterwards.
    pub async fn delete(self) -> io::Result<()> {
        fs::remove_file(&self.path).await
    }
}

/// A part while its body is still streaming in.
pub struct UploadWriter {
    file: fs::File,
    path: PathBuf,
    size: u64,
    max_part_bytes: u64,
    head: PartHead,
}

impl UploadWriter {
    pub async fn write(&mut self, data: &[u8]) -> Result<(), UploadError> {
        if self.size + data.len() as u64 > self.max_part_bytes {
            return Err(UploadError::PartTooLarge);
        }
        self.file.write_all(data).await?;
        self.size += data.len() as u64;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Closing boundary reached: flush and hand over ownership.
    pub async fn finish(mut self) -> Result<UploadPart, UploadError> {
        self.file.flush().await?;
        Ok(UploadPart {
            path: self.path,
            size: self.size,
            field_name: self.head.field_name,
            file_name: self.head.file_name,
            content_type: self.head.content_type,
        })
    }

    /// Failure or cancellation: drop the partial file.
    pub async fn abort(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.path).await;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Creates part files under the configured upload directory with unique
/// random names, preserving the declared filename's extension.
pub struct UploadManager {
    dir: PathBuf,
    max_part_bytes: u64,
}

impl UploadManager {
    pub fn new(dir: impl Into<PathBuf>, max_part_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_part_bytes,
        }
    }

    fn random_name(head: &PartHead) -> io::Result<String> {
        let mut raw = [0u8; 8];
        getrandom::getrandom(&mut raw)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        let mut name = String::with_capacity(24);
        for b in raw {
            name.push_str(&format!("{:02x}", b));
        }
        // Keep the declared extension so handlers can type-sniff by name.
        if let Some(ext) = head
            .file_name
            .as_deref()
            .and_then(|f| Path::new(f).extension())
            .and_then(|e| e.to_str())
        {
            if ext.len() <= 16 && ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
                name.push('.');
                name.push_str(ext);
            }
        }
        Ok(name)
    }

    /// Open the temp file for a new part, bounded by `max_part_bytes`.
    pub async fn open_part(&self, head: PartHead) -> Result<UploadWriter, UploadError> {
        self.open_part_with_limit(head, self.max_part_bytes).await
    }

    /// Open a part with an explicit size bound. Octet-stream bodies are one
    /// part limited only by the whole-body budget.
    pub async fn open_part_with_limit(
        &self,
        head: PartHead,
        max_part_bytes: u64,
    ) -> Result<UploadWriter, UploadError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::random_name(&head)?);
        let file = fs::File::create(&path).await?;
        Ok(UploadWriter {
            file,
            path,
            size: 0,
            max_part_bytes,
            head,
        })
    }
}

/// Remove the files behind already-finalized parts (cancellation path).
pub async fn discard_parts(parts: Vec<UploadPart>) {
    for part in parts {
        let _ = part.delete().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max: u64) -> UploadManager {
        let dir = std::env::temp_dir().join("locanda-upload-tests");
        UploadManager::new(dir, max)
    }

    #[tokio::test]
    async fn stream_and_finish() {
        let mgr = manager(1024);
        let head = PartHead {
            field_name: "file1".to_string(),
            file_name: Some("photo.png".to_string()),
            content_type: Some("image/png".to_string()),
        };
        let mut writer = mgr.open_part(head).await.unwrap();
        writer.write(b"abcd").await.unwrap();
        writer.write(b"efgh").await.unwrap();
        let part = writer.finish().await.unwrap();
        assert_eq!(part.size(), 8);
        assert_eq!(part.field_name(), "file1");
        assert_eq!(part.file_name(), Some("photo.png"));
        assert!(part.path().extension().is_some_and(|e| e == "png"));
        assert_eq!(part.read().await.unwrap(), b"abcdefgh");
        part.delete().await.unwrap();
    }

    #[tokio::test]
    async fn limit_exceeded_and_abort_removes_file() {
        let mgr = manager(4);
        let mut writer = mgr
            .open_part(PartHead {
                field_name: "f".to_string(),
                file_name: None,
                content_type: None,
            })
            .await
            .unwrap();
        writer.write(b"ab").await.unwrap();
        let err = writer.write(b"cdefgh").await.unwrap_err();
        assert_eq!(err.status(), 413);
        let path = writer.path().to_path_buf();
        assert!(path.exists());
        writer.abort().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unique_names() {
        let mgr = manager(16);
        let head = PartHead::default();
        let a = mgr.open_part(head.clone()).await.unwrap();
        let b = mgr.open_part(head).await.unwrap();
        assert_ne!(a.path(), b.path());
        a.abort().await;
        b.abort().await;
    }
}
