/*
 * cache.rs
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

//! Response cache keyed on request fingerprint (method, path, canonical
//! query, Vary-selected headers, accepted encoding). Sharded; entries expire
//! lazily and by sweep, and are LRU-evicted past a soft bound. Concurrent
//! misses on one fingerprint are single-flight: the first caller builds, the
//! rest await its publication. A failed build publishes nothing and the
//! waiters retry as first callers; a pending build is pinned against
//! eviction.

use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::protocol::http::encoding;
use crate::protocol::http::request::Request;
use crate::protocol::http::response::ContentEncoding;

const SHARDS: usize = 16;

/// Fully materialized response ready to replay.
#[derive(Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub encoding: ContentEncoding,
}

/// Canonical cache key. The text form is kept for prefix invalidation; the
/// hash only picks the shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    key: String,
}

impl Fingerprint {
    /// Derive from a request: method, decoded path, sorted query pairs, the
    /// values of the configured Vary headers, and which content codings the
    /// client accepts.
    pub fn compute(req: &Request, vary: &[String]) -> Fingerprint {
        let mut key = String::with_capacity(64);
        if let Some(m) = req.method {
            key.push_str(m.as_str());
        }
        key.push(' ');
        key.push_str(&req.path);
        let mut pairs: Vec<&(String, String)> = req.query.iter().collect();
        pairs.sort();
        key.push('?');
        for (k, v) in pairs {
            key.push_str(k);
            key.push('=');
            key.push_str(v);
            key.push('&');
        }
        key.push_str("|vary:");
        for name in vary {
            key.push_str(name);
            key.push('=');
            if let Some(v) = req.header(name) {
                key.push_str(v);
            }
            key.push(';');
        }
        key.push_str("|ae:");
        let ae = req.header("Accept-Encoding");
        for token in ["gzip", "deflate", "br"] {
            if encoding::accepts(ae, token) {
                key.push_str(token);
                key.push(',');
            }
        }
        Fingerprint { key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The decoded path component of the key, for prefix invalidation.
    fn path(&self) -> &str {
        let start = self.key.find(' ').map(|i| i + 1).unwrap_or(0);
        let end = self.key.find('?').unwrap_or(self.key.len());
        &self.key[start..end.max(start)]
    }
}

enum BuildState {
    Building,
    Done(Option<Arc<CachedResponse>>),
}

enum Slot {
    Ready {
        entry: Arc<CachedResponse>,
        expires: Instant,
        last_used: Instant,
    },
    /// In-flight single-flight build; pinned until published or abandoned.
    Pending { rx: watch::Receiver<BuildState> },
}

struct Inner {
    shards: Vec<Mutex<HashMap<String, Slot>>>,
    per_shard_max: usize,
}

impl Inner {
    fn shard(&self, key: &str) -> &Mutex<HashMap<String, Slot>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Evict least-recently-used Ready slots past the soft bound. Pending
    /// slots are never touched.
    fn evict_lru(map: &mut HashMap<String, Slot>, per_shard_max: usize) {
        while map.len() > per_shard_max {
            let victim = map
                .iter()
                .filter_map(|(k, slot)| match slot {
                    Slot::Ready { last_used, .. } => Some((k.clone(), *last_used)),
                    Slot::Pending { .. } => None,
                })
                .min_by_key(|(_, t)| *t)
                .map(|(k, _)| k);
            match victim {
                Some(k) => {
                    map.remove(&k);
                }
                None => break,
            }
        }
    }
}

/// Outcome of a cache lookup.
pub enum Lookup {
    Hit(Arc<CachedResponse>),
    /// Absent: the caller is the builder and must publish (or drop) the guard.
    Build(BuildGuard),
    /// Another caller is building; wait for its publication.
    Pending(Waiter),
}

/// Ticket for the single in-flight build of a fingerprint.
pub struct BuildGuard {
    inner: Arc<Inner>,
    key: String,
    tx: watch::Sender<BuildState>,
    published: bool,
}

impl BuildGuard {
    /// Publish the built response to the cache (unless `ttl` is zero) and to
    /// every waiter.
    pub fn publish(mut self, response: CachedResponse, ttl: Duration) {
        let entry = Arc::new(response);
        {
            let mut map = self.inner.shard(&self.key).lock().unwrap();
            map.remove(&self.key);
            if !ttl.is_zero() {
                let now = Instant::now();
                map.insert(
                    self.key.clone(),
                    Slot::Ready {
                        entry: entry.clone(),
                        expires: now + ttl,
                        last_used: now,
                    },
                );
                Inner::evict_lru(&mut map, self.inner.per_shard_max);
            }
        }
        let _ = self.tx.send(BuildState::Done(Some(entry)));
        self.published = true;
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        if !self.published {
            // Build failed or was abandoned: waiters observe a miss and the
            // next lookup starts a fresh build. Failures never poison.
            let mut map = self.inner.shard(&self.key).lock().unwrap();
            if matches!(map.get(&self.key), Some(Slot::Pending { .. })) {
                map.remove(&self.key);
            }
            drop(map);
            let _ = self.tx.send(BuildState::Done(None));
        }
    }
}

/// Receiver side of a pending build.
pub struct Waiter {
    rx: watch::Receiver<BuildState>,
}

impl Waiter {
    /// Resolve to the published response, or None when the build failed
    /// (the caller should retry the lookup as a first caller).
    pub async fn wait(mut self) -> Option<Arc<CachedResponse>> {
        loop {
            {
                let state = self.rx.borrow();
                if let BuildState::Done(result) = &*state {
                    return result.clone();
                }
            }
            if self.rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

/// Global per-server response cache.
pub struct ResponseCache {
    inner: Arc<Inner>,
    /// Request headers folded into every fingerprint.
    vary: Vec<String>,
}

impl ResponseCache {
    pub fn new(max_entries: usize) -> Self {
        Self::with_vary(max_entries, Vec::new())
    }

    pub fn with_vary(max_entries: usize, vary: Vec<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
                per_shard_max: (max_entries / SHARDS).max(1),
            }),
            vary,
        }
    }

    pub fn fingerprint(&self, req: &Request) -> Fingerprint {
        Fingerprint::compute(req, &self.vary)
    }

    pub fn lookup(&self, fp: &Fingerprint) -> Lookup {
        let mut map = self.inner.shard(&fp.key).lock().unwrap();
        let now = Instant::now();
        let mut expired = false;
        match map.get_mut(&fp.key) {
            Some(Slot::Ready {
                entry,
                expires,
                last_used,
            }) => {
                if *expires <= now {
                    expired = true;
                } else {
                    *last_used = now;
                    return Lookup::Hit(entry.clone());
                }
            }
            Some(Slot::Pending { rx }) => {
                return Lookup::Pending(Waiter { rx: rx.clone() });
            }
            None => {}
        }
        if expired {
            map.remove(&fp.key);
        }
        let (tx, rx) = watch::channel(BuildState::Building);
        map.insert(fp.key.clone(), Slot::Pending { rx });
        Lookup::Build(BuildGuard {
            inner: self.inner.clone(),
            key: fp.key.clone(),
            tx,
            published: false,
        })
    }

    /// Drop one entry. Pending builds are left to finish.
    pub fn invalidate(&self, fp: &Fingerprint) {
        let mut map = self.inner.shard(&fp.key).lock().unwrap();
        if matches!(map.get(&fp.key), Some(Slot::Ready { .. })) {
            map.remove(&fp.key);
        }
    }

    /// Drop every Ready entry whose path starts with `prefix`.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut removed = 0;
        for shard in &self.inner.shards {
            let mut map = shard.lock().unwrap();
            let keys: Vec<String> = map
                .iter()
                .filter(|(k, slot)| {
                    matches!(slot, Slot::Ready { .. })
                        && Fingerprint { key: (*k).clone() }.path().starts_with(prefix)
                })
                .map(|(k, _)| k.clone())
                .collect();
            removed += keys.len();
            for k in keys {
                map.remove(&k);
            }
        }
        removed
    }

    /// Remove expired entries. Called by the server's periodic sweep.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.inner.shards {
            let mut map = shard.lock().unwrap();
            let before = map.len();
            map.retain(|_, slot| match slot {
                Slot::Ready { expires, .. } => *expires > now,
                Slot::Pending { .. } => true,
            });
            removed += before - map.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner
            .shards
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
