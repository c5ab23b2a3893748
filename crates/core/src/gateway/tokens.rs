use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use crate::domain::write::WriteEnvelope;

#[derive(Clone, Debug)]
struct PendingCommit {
    envelope: WriteEnvelope,
    expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TokenRejection {
    Unknown,
    Expired(Box<WriteEnvelope>),
}

/// Approved-but-uncommitted writes, keyed by single-use commit token.
#[derive(Debug)]
pub struct PendingCommits {
    ttl: Duration,
    entries: Mutex<HashMap<String, PendingCommit>>,
}

impl PendingCommits {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, envelope: WriteEnvelope, now: DateTime<Utc>) -> (String, DateTime<Utc>) {
        let token = mint_token();
        let expires_at = now + self.ttl;

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(token.clone(), PendingCommit { envelope, expires_at });
        (token, expires_at)
    }

    /// Removes the entry for `token`. A token is usable at most once, whether or not it had
    /// already expired.
    pub fn take(&self, token: &str, now: DateTime<Utc>) -> Result<WriteEnvelope, TokenRejection> {
        let pending = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.remove(token)
        };

        match pending {
            None => Err(TokenRejection::Unknown),
            Some(pending) if pending.expires_at <= now => {
                Err(TokenRejection::Expired(Box::new(pending.envelope)))
            }
            Some(pending) => Ok(pending.envelope),
        }
    }

    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, pending| pending.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn mint_token() -> String {
    let mut bytes = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}
