//! Session Layer
//!
//! Maps live connections to authenticated users. Token lookup and account
//! load touch I/O and therefore run on the async side, never on a matching
//! thread. A dropped connection must remove its session immediately so a
//! recycled connection id cannot inherit another user's identity.

use crate::auth::token::TokenStore;
use crate::db::Database;
use crate::metrics as obs;
use crate::services::accounts::AccountManager;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    authenticated: bool,
    last_activity: Instant,
}

impl Session {
    fn authenticated(user_id: String) -> Self {
        Self {
            user_id,
            authenticated: true,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated(String),
    AlreadyAuthenticated(String),
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("invalid or expired token")]
    InvalidToken,

    #[error("token store unavailable")]
    StoreUnavailable(#[source] redis::RedisError),

    #[error("account could not be loaded")]
    AccountUnavailable(#[source] sqlx::Error),
}

/// The session table itself: one lock, short critical sections.
#[derive(Default)]
struct SessionTable {
    sessions: Mutex<HashMap<ConnectionId, Session>>,
}

impl SessionTable {
    fn authenticated_user(&self, conn_id: ConnectionId) -> Option<String> {
        let sessions = self.sessions.lock();
        sessions
            .get(&conn_id)
            .filter(|s| s.authenticated)
            .map(|s| s.user_id.clone())
    }

    fn insert(&self, conn_id: ConnectionId, user_id: String) {
        self.sessions
            .lock()
            .insert(conn_id, Session::authenticated(user_id));
    }

    fn touch(&self, conn_id: ConnectionId) {
        if let Some(session) = self.sessions.lock().get_mut(&conn_id) {
            session.last_activity = Instant::now();
        }
    }

    fn remove(&self, conn_id: ConnectionId) -> Option<String> {
        self.sessions.lock().remove(&conn_id).map(|s| s.user_id)
    }

    fn expire_idle(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, s| now.duration_since(s.last_activity) <= timeout);
        before - sessions.len()
    }

    fn len(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Authenticates connections against the token store and keeps the
/// connection -> user mapping.
pub struct SessionManager {
    table: SessionTable,
    tokens: Arc<TokenStore>,
    accounts: Arc<AccountManager>,
    db: Database,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(
        tokens: Arc<TokenStore>,
        accounts: Arc<AccountManager>,
        db: Database,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            table: SessionTable::default(),
            tokens,
            accounts,
            db,
            idle_timeout,
        }
    }

    /// Validate a token, make sure the account is resident, and record the
    /// session. Repeating on a live session is reported, not an error.
    pub async fn authenticate(
        &self,
        conn_id: ConnectionId,
        token: &str,
    ) -> Result<AuthOutcome, AuthError> {
        if let Some(user_id) = self.table.authenticated_user(conn_id) {
            return Ok(AuthOutcome::AlreadyAuthenticated(user_id));
        }

        let user_id = self
            .tokens
            .lookup(token)
            .await
            .map_err(AuthError::StoreUnavailable)?
            .ok_or(AuthError::InvalidToken)?;

        self.accounts
            .ensure_loaded(&user_id, &self.db)
            .await
            .map_err(AuthError::AccountUnavailable)?;
        if let Some(account) = self.accounts.snapshot(&user_id) {
            tracing::debug!(
                user_id = %user_id,
                cash = account.cash,
                buying_power = account.buying_power,
                "account resident"
            );
        }

        self.table.insert(conn_id, user_id.clone());
        obs::set_active_sessions(self.table.len() as i64);
        info!(conn_id, user_id = %user_id, "connection authenticated");
        Ok(AuthOutcome::Authenticated(user_id))
    }

    pub fn is_authenticated(&self, conn_id: ConnectionId) -> bool {
        self.table.authenticated_user(conn_id).is_some()
    }

    pub fn user_id(&self, conn_id: ConnectionId) -> Option<String> {
        self.table.authenticated_user(conn_id)
    }

    pub fn touch(&self, conn_id: ConnectionId) {
        self.table.touch(conn_id);
    }

    /// Drop a connection's session (transport disconnect).
    pub fn remove(&self, conn_id: ConnectionId) {
        if let Some(user_id) = self.table.remove(conn_id) {
            info!(conn_id, user_id = %user_id, "session removed");
        }
        obs::set_active_sessions(self.table.len() as i64);
    }

    pub fn active_count(&self) -> usize {
        self.table.len()
    }

    /// Prune idle sessions; called periodically from the sweep task.
    pub fn expire_idle(&self) -> usize {
        let expired = self.table.expire_idle(self.idle_timeout);
        if expired > 0 {
            warn!(expired, "expired idle sessions");
            obs::set_active_sessions(self.table.len() as i64);
        }
        expired
    }

    /// Background sweep for idle sessions, checking every minute.
    pub fn spawn_idle_sweep(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = self;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                manager.expire_idle();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_lifecycle() {
        let table = SessionTable::default();
        assert!(table.authenticated_user(1).is_none());

        table.insert(1, "alice".to_string());
        assert_eq!(table.authenticated_user(1).as_deref(), Some("alice"));
        assert_eq!(table.len(), 1);

        // A new connection reusing the id after removal sees no identity.
        assert_eq!(table.remove(1).as_deref(), Some("alice"));
        assert!(table.authenticated_user(1).is_none());
        assert!(table.remove(1).is_none());
    }

    #[test]
    fn test_idle_expiry_respects_touch() {
        let table = SessionTable::default();
        table.insert(1, "alice".to_string());
        table.insert(2, "bob".to_string());

        // Backdate both sessions, then refresh only bob's.
        {
            let mut sessions = table.sessions.lock();
            for session in sessions.values_mut() {
                session.last_activity = Instant::now() - Duration::from_secs(120);
            }
        }
        table.touch(2);

        let expired = table.expire_idle(Duration::from_secs(60));
        assert_eq!(expired, 1);
        assert!(table.authenticated_user(1).is_none());
        assert_eq!(table.authenticated_user(2).as_deref(), Some("bob"));
    }
}
