/*
 * mod.rs
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

//! HTTP/1.x server engine.
//!
//! Layering, leaves first: the `h1` wire codec parses request bytes and
//! serializes responses; `router`, `session`, `upload`, `cache` and
//! `aspect` are the per-request collaborators; `connection` is the
//! per-connection state machine that owns them at request granularity;
//! `server` accepts streams and hands them to connections.

pub mod aspect;
pub mod cache;
pub mod connection;
pub mod encoding;
pub mod h1;
pub mod multipart;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod session;
pub mod static_files;
pub mod upload;

pub use connection::{ConnectionHandle, DelayedResponse, HttpConnection, ServerContext};
pub use request::{Body, ContentType, Method, Request, Version};
pub use response::{BodyKind, CachePolicy, ContentEncoding, Response, StatusCode};
pub use router::{handler_fn, Handler, HandlerError, Resolution, Router, RouterError};
pub use server::HttpServer;
