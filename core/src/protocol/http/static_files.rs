/*
 * static_files.rs
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

//! Static resource serving: GET/HEAD requests that miss the router are
//! resolved against `static_dir` by prefix match. Small files go out with
//! Content-Length; files over the configured threshold are sent chunked.

use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config::ServerConfig;
use crate::protocol::http::response::{BodyKind, Response, StatusCode};

/// Map a request path onto the static directory. None when the path climbs
/// out of the tree or names nothing servable.
fn resolve_path(static_dir: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.strip_prefix('/').unwrap_or(request_path);
    if relative.is_empty() {
        return None;
    }
    let mut path = static_dir.to_path_buf();
    for segment in relative.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

/// Content-Type from the file extension, defaulting to octet-stream.
fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("pdf") => "application/pdf",
        Some("wasm") => "application/wasm",
        Some("xml") => "application/xml",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Try to serve `request_path` from `static_dir` into `res`. Returns false
/// when the path does not name a servable file (caller falls through to 404).
pub async fn serve(
    static_dir: &Path,
    request_path: &str,
    config: &ServerConfig,
    res: &mut Response,
) -> bool {
    let path = match resolve_path(static_dir, request_path) {
        Some(p) => p,
        None => return false,
    };
    let meta = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => return false,
    };

    res.status = Some(StatusCode::OK);
    res.set_header_if_absent("Content-Type", content_type_for(&path));
    res.set_header(
        "Cache-Control",
        format!("max-age={}", config.static_resource_max_age),
    );

    if meta.len() > config.static_chunk_threshold {
        // Large file: chunked framing. The generator does blocking reads;
        // the connection polls generators on the blocking pool, never on a
        // worker thread.
        let mut file = match std::fs::File::open(&path) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let mut done = false;
        res.body = BodyKind::Chunked(Box::new(move || {
            if done {
                return None;
            }
            let mut buf = vec![0u8; 64 * 1024];
            match file.read(&mut buf) {
                Ok(0) | Err(_) => {
                    done = true;
                    None
                }
                Ok(n) => {
                    buf.truncate(n);
                    Some(Bytes::from(buf))
                }
            }
        }));
    } else {
        res.body = BodyKind::File(path);
    }
    true
}
