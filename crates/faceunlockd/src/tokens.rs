//! One-time enrollment tokens, held in memory only.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Issued enrollment tokens and when they were issued.
pub struct EnrollTokens {
    issued: Mutex<HashMap<String, Instant>>,
    ttl: Option<Duration>,
}

impl EnrollTokens {
    /// `ttl = None` keeps a token until it is consumed.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            issued: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Issue a fresh random token.
    pub fn issue(&self) -> String {
        let token = Uuid::new_v4().to_string();
        let mut issued = self.lock();
        issued.insert(token.clone(), Instant::now());
        tracing::info!(outstanding = issued.len(), "enroll token issued");
        token
    }

    /// Whether `token` was issued, is unused and has not expired.
    pub fn is_valid(&self, token: &str) -> bool {
        let mut issued = self.lock();
        self.purge_expired(&mut issued);
        issued.contains_key(token)
    }

    /// Remove a valid token, returning when it was issued.
    pub fn take(&self, token: &str) -> Option<Instant> {
        let mut issued = self.lock();
        self.purge_expired(&mut issued);
        issued.remove(token)
    }

    /// Put back a token taken for an enrollment that did not complete.
    pub fn restore(&self, token: String, issued_at: Instant) {
        self.lock().insert(token, issued_at);
    }

    /// Number of outstanding tokens.
    pub fn outstanding(&self) -> usize {
        let mut issued = self.lock();
        self.purge_expired(&mut issued);
        issued.len()
    }

    fn purge_expired(&self, issued: &mut HashMap<String, Instant>) {
        if let Some(ttl) = self.ttl {
            let before = issued.len();
            issued.retain(|_, at| at.elapsed() < ttl);
            let dropped = before - issued.len();
            if dropped > 0 {
                tracing::debug!(dropped, "expired enroll tokens purged");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Instant>> {
        self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
