/*
 * session.rs
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

//! Cookie-bound in-memory sessions. Tokens are 128 bits from the system RNG,
//! base64url. The table is sharded; expired entries are dropped lazily on
//! lookup and eagerly by the server's periodic sweep. Mutation of one
//! session's data is serialized by its own lock.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Cookie carrying the session token.
pub const SESSION_COOKIE: &str = "LSESSIONID";

/// Default in-memory lifetime, also applied to Max-Age=-1 session cookies to
/// bound table growth.
pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

const SHARDS: usize = 16;

/// One session: opaque token, absolute expiry, name → value data.
pub struct Session {
    token: String,
    created: Instant,
    state: Mutex<SessionState>,
}

struct SessionState {
    expiry: Instant,
    /// Max-Age for the cookie; -1 means browser-session cookie.
    max_age: i64,
    data: HashMap<String, String>,
}

impl Session {
    fn new(token: String) -> Self {
        let created = Instant::now();
        Self {
            token,
            created,
            state: Mutex::new(SessionState {
                expiry: created + Duration::from_secs(DEFAULT_MAX_AGE_SECS),
                max_age: DEFAULT_MAX_AGE_SECS as i64,
                data: HashMap::new(),
            }),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().data.get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .data
            .insert(name.into(), value.into());
    }

    pub fn remove(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().data.remove(name)
    }

    /// Set the cookie Max-Age. -1 requests a browser-session cookie; the
    /// in-memory expiry still defaults to one hour.
    pub fn set_max_age(&self, max_age: i64) {
        let mut state = self.state.lock().unwrap();
        state.max_age = max_age;
        let secs = if max_age < 0 {
            DEFAULT_MAX_AGE_SECS
        } else {
            max_age as u64
        };
        state.expiry = Instant::now() + Duration::from_secs(secs);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.state.lock().unwrap().expiry
    }

    /// `Set-Cookie` value announcing this session.
    pub fn cookie_value(&self) -> String {
        let max_age = self.state.lock().unwrap().max_age;
        if max_age < 0 {
            format!("{}={}; HttpOnly; Path=/", SESSION_COOKIE, self.token)
        } else {
            format!(
                "{}={}; HttpOnly; Path=/; Max-Age={}",
                SESSION_COOKIE, self.token, max_age
            )
        }
    }
}

/// Process-wide session table, sharded 16 ways.
pub struct SessionStore {
    shards: Vec<Mutex<HashMap<String, Arc<Session>>>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, token: &str) -> &Mutex<HashMap<String, Arc<Session>>> {
        let mut hasher = DefaultHasher::new();
        token.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    fn generate_token() -> std::io::Result<String> {
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    /// Create and register a fresh session.
    pub fn start(&self) -> std::io::Result<Arc<Session>> {
        let token = Self::generate_token()?;
        let session = Arc::new(Session::new(token.clone()));
        self.shard(&token)
            .lock()
            .unwrap()
            .insert(token, session.clone());
        Ok(session)
    }

    /// O(1) average lookup; expired entries are removed on sight.
    pub fn lookup(&self, token: &str) -> Option<Arc<Session>> {
        let mut shard = self.shard(token).lock().unwrap();
        let found = shard.get(token).cloned();
        match found {
            Some(session) if session.is_expired(Instant::now()) => {
                shard.remove(token);
                None
            }
            Some(session) => Some(session),
            None => None,
        }
    }

    pub fn destroy(&self, token: &str) {
        self.shard(token).lock().unwrap().remove(token);
    }

    /// Drop every expired session. Called by the server's periodic sweep.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, s| !s.is_expired(now));
            removed += before - shard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_lookup_destroy() {
        let store = SessionStore::new();
        let session = store.start().unwrap();
        session.set("userid", "1");
        let token = session.token().to_string();
        assert_eq!(token.len(), 22); // 16 bytes base64url, no padding

        let found = store.lookup(&token).unwrap();
        assert_eq!(found.get("userid").as_deref(), Some("1"));

        store.destroy(&token);
        assert!(store.lookup(&token).is_none());
    }

    #[test]
    fn tokens_are_unique() {
        let store = SessionStore::new();
        let a = store.start().unwrap();
        let b = store.start().unwrap();
        assert_ne!(a.token(), b.token());
    }

    #[test]
    fn expiry_lazy_and_sweep() {
        let store = SessionStore::new();
        let session = store.start().unwrap();
        let token = session.token().to_string();
        session.set_max_age(0);
        assert!(store.lookup(&token).is_none());

        let session = store.start().unwrap();
        session.set_max_age(0);
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn session_cookie_formats() {
        let store = SessionStore::new();
        let session = store.start().unwrap();
        let v = session.cookie_value();
        assert!(v.starts_with(&format!("{}=", SESSION_COOKIE)));
        assert!(v.contains("HttpOnly"));
        assert!(v.contains("Max-Age=3600"));

        session.set_max_age(-1);
        let v = session.cookie_value();
        assert!(!v.contains("Max-Age"));
        // Browser-session cookies still expire server-side.
        assert!(!session.is_expired(Instant::now()));
    }
}
