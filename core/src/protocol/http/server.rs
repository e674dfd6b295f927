/*
 * server.rs
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

//! Server front: binds the listener, accepts streams (plain or TLS), pins
//! each connection to its own task, runs the cache/session sweeps, and
//! drains connections on stop within the grace period. Routes are
//! registered before `bind`; the router is immutable afterwards.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

use rand::Rng;

use crate::config::{RouteConfig, ServerConfig};
use crate::net::{HttpStream, TlsContext};
use crate::protocol::http::connection::{HttpConnection, ServerContext};
use crate::protocol::http::request::Method;
use crate::protocol::http::router::{Handler, Router, RouterError};

/// Server under construction: configuration plus route table.
pub struct HttpServer {
    config: ServerConfig,
    router: Router,
}

impl HttpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
        }
    }

    /// Register a handler: method set, pattern, handler, per-route
    /// configuration (cache opt-in + aspects).
    pub fn route(
        &mut self,
        methods: &[Method],
        pattern: &str,
        handler: Handler,
        route_config: RouteConfig,
    ) -> Result<(), RouterError> {
        self.router.register(methods, pattern, handler, route_config)
    }

    /// Bind the listener and start accepting. The returned handle owns the
    /// accept task; use `stop()` for a drained shutdown.
    pub async fn bind(self) -> io::Result<RunningServer> {
        let tls = if self.config.enable_tls {
            let cert = self.config.cert_path.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "enable_tls without cert_path")
            })?;
            let key = self.config.key_path.clone().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "enable_tls without key_path")
            })?;
            Some(Arc::new(TlsContext::from_pem_files(&cert, &key)?))
        } else {
            None
        };

        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {}", local_addr);

        let grace = self.config.shutdown_grace;
        let ctx = Arc::new(ServerContext::new(self.config, self.router));
        let (stop_tx, stop_rx) = watch::channel(false);

        // Periodic sweep for expired cache entries and sessions, jittered so
        // many servers in one process do not sweep in lockstep.
        let sweep_ctx = ctx.clone();
        let mut sweep_stop = stop_rx.clone();
        tokio::spawn(async move {
            let period = Duration::from_secs(60 + rand::thread_rng().gen_range(0..10));
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let cache = sweep_ctx.cache.sweep();
                        let sessions = sweep_ctx.sessions.sweep();
                        if cache + sessions > 0 {
                            log::debug!("sweep removed {} cache entries, {} sessions", cache, sessions);
                        }
                    }
                    _ = sweep_stop.changed() => return,
                }
            }
        });

        let accept_ctx = ctx.clone();
        let mut accept_stop = stop_rx.clone();
        let accept_task = tokio::spawn(async move {
            let mut connections: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    _ = accept_stop.changed() => break,
                    accepted = listener.accept() => {
                        let (tcp, addr) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                log::warn!("accept failed: {}", e);
                                continue;
                            }
                        };
                        log::debug!("accepted connection from {}", addr);
                        let ctx = accept_ctx.clone();
                        let stop = stop_rx.clone();
                        let tls = tls.clone();
                        connections.spawn(async move {
                            let stream = match tls {
                                Some(tls) => match tls.accept(tcp).await {
                                    Ok(stream) => stream,
                                    Err(e) => {
                                        log::debug!("TLS handshake with {} failed: {}", addr, e);
                                        return;
                                    }
                                },
                                None => HttpStream::Plain(tcp),
                            };
                            HttpConnection::new(stream, Some(addr), ctx, stop)
                                .serve()
                                .await;
                        });
                    }
                    // Reap finished connections so the set stays small.
                    Some(_) = connections.join_next(), if !connections.is_empty() => {}
                }
            }
            // Drain in-flight connections up to the grace period, then
            // force-close whatever is left.
            drop(listener);
            let drained = timeout(grace, async {
                while connections.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                log::warn!("grace period over, aborting {} connections", connections.len());
                connections.shutdown().await;
            }
        });

        Ok(RunningServer {
            local_addr,
            stop_tx,
            ctx,
            accept_task,
        })
    }

    /// Convenience entry point: build a multi-thread runtime sized by
    /// `worker_threads` and serve until the process is killed.
    pub fn run_blocking(self) -> io::Result<()> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads.max(1))
            .enable_all()
            .build()?;
        runtime.block_on(async move {
            let running = self.bind().await?;
            running.accept_task.await.ok();
            Ok(())
        })
    }
}

/// A bound, accepting server.
pub struct RunningServer {
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    ctx: Arc<ServerContext>,
    accept_task: tokio::task::JoinHandle<()>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Stop accepting, drain in-flight handlers up to the grace period,
    /// force-close the rest.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.accept_task.await;
        log::info!("server on {} stopped", self.local_addr);
    }
}
