/*
 * lib.rs
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

//! Locanda core: an embeddable asynchronous HTTP/1.1 server with WebSocket
//! support.
//!
//! The centre of the crate is the per-connection engine in
//! `protocol::http::connection`: a push-parsed state machine that drives the
//! request/response lifecycle (streaming bodies, chunked transfer, multipart
//! uploads, WebSocket upgrade) over a plain or TLS stream. Around it sit the
//! router, the handler aspect chain, the single-flight response cache, the
//! session store and the upload manager, all explicitly constructed by
//! `HttpServer` and injected into each connection.

pub mod config;
pub mod net;
pub mod urlcodec;

pub mod protocol;

pub use config::{RouteConfig, ServerConfig};
pub use protocol::http::aspect::{Aspect, AspectOutcome};
pub use protocol::http::connection::ConnectionHandle;
pub use protocol::http::request::{Body, ContentType, Method, Request, Version};
pub use protocol::http::response::{BodyKind, CachePolicy, ContentEncoding, Response, StatusCode};
pub use protocol::http::router::{handler_fn, Handler, Router};
pub use protocol::http::server::HttpServer;
pub use protocol::http::upload::UploadPart;
pub use protocol::websocket::WebSocketHandler;
