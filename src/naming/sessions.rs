//! The session table: active client logins, one per username.
//!
//! The router task owns the client socket; the table records who is
//! logged in, from where, and since when. A second login for the same
//! username is rejected with the `FileLocked` status (the protocol's
//! historical encoding for "already logged in") carrying the previous
//! peer address and login age, and the offending connection is closed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use crate::protocol::ops::{OpError, Status};

/// One active login.
#[derive(Clone, Debug)]
pub struct Session {
    pub username: String,
    pub peer: String,
    pub login_time: SystemTime,
}

/// Formats a timestamp's age as a short human-readable string.
pub fn fmt_age(at: SystemTime) -> String {
    match at.elapsed() {
        Ok(age) => format!("{}s ago", age.as_secs()),
        Err(_) => "just now".to_string(),
    }
}

#[derive(Default)]
pub struct SessionTable {
    inner: Mutex<HashMap<String, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a login; fails when the username already has a session.
    pub fn login(&self, username: &str, peer: &str) -> Result<(), OpError> {
        let mut inner = self.inner.lock().expect("session table poisoned");
        if let Some(existing) = inner.get(username) {
            return Err(OpError::new(
                Status::FileLocked,
                format!(
                    "user '{}' is already logged in from {} ({})",
                    username,
                    existing.peer,
                    fmt_age(existing.login_time)
                ),
            ));
        }
        inner.insert(
            username.to_string(),
            Session {
                username: username.to_string(),
                peer: peer.to_string(),
                login_time: SystemTime::now(),
            },
        );
        Ok(())
    }

    /// Removes a session when its connection ends.
    pub fn logout(&self, username: &str) {
        let mut inner = self.inner.lock().expect("session table poisoned");
        inner.remove(username);
    }

    pub fn is_active(&self, username: &str) -> bool {
        self.inner.lock().expect("session table poisoned").contains_key(username)
    }

    /// All active sessions, sorted by username.
    pub fn snapshot(&self) -> Vec<Session> {
        let inner = self.inner.lock().expect("session table poisoned");
        let mut sessions: Vec<Session> = inner.values().cloned().collect();
        sessions.sort_by(|a, b| a.username.cmp(&b.username));
        sessions
    }
}
