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

//! Server-side WebSocket engine (RFC 6455): upgrade handshake validation,
//! frame codec, and the per-connection read loop a handler plugs into after
//! the 101 response.

pub mod connection;
pub mod frame;
pub mod handler;
pub mod handshake;

pub use connection::WsConnection;
pub use handler::{WebSocketHandler, WsOutbox};
pub use handshake::{compute_accept, is_upgrade_request, validate_upgrade, UpgradeRequest};
