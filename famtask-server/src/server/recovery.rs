//! Password-recovery collaborators: the mail capability and the keyed
//! TTL cache holding outstanding recovery codes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;

/// Mail delivery capability. The core only needs "send an email given
/// recipient, subject, body"; wiring a real SMTP/API transport is the
/// deployment's problem.
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, html_body: &str);
}

/// Default mailer: logs the send instead of delivering it. Useful for
/// development and for tests that only assert the HTTP contract.
pub struct LogMailer;

impl Mailer for LogMailer {
    fn send(&self, to: &str, subject: &str, html_body: &str) {
        tracing::info!(to, subject, body_len = html_body.len(), "mail: send requested");
    }
}

const CODE_TTL_MINUTES: i64 = 15;

struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Outstanding recovery codes keyed by user id, each with an explicit
/// expiry. Expired entries are dropped on every insert and lookup, so
/// the map never outgrows the set of users mid-recovery.
#[derive(Clone, Default)]
pub struct RecoveryCodes {
    inner: Arc<Mutex<HashMap<i32, PendingCode>>>,
}

impl RecoveryCodes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh 6-digit code for the user, replacing any earlier
    /// one still pending.
    pub async fn issue(&self, user_id: i32) -> String {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let mut map = self.inner.lock().await;
        let now = Utc::now();
        map.retain(|_, pending| pending.expires_at > now);
        map.insert(
            user_id,
            PendingCode {
                code: code.clone(),
                expires_at: now + Duration::minutes(CODE_TTL_MINUTES),
            },
        );
        code
    }

    /// Consume the user's pending code. Returns `true` only when a live
    /// code matches; the entry is removed either way on a match attempt
    /// so codes are single-use.
    pub async fn consume(&self, user_id: i32, code: &str) -> bool {
        let mut map = self.inner.lock().await;
        let now = Utc::now();
        map.retain(|_, pending| pending.expires_at > now);
        match map.remove(&user_id) {
            Some(pending) if pending.code == code => true,
            _ => false,
        }
    }
}
