//! Consumer session policy
//!
//! With an API secret configured, any number of clients may connect as long
//! as they present it. Without one, the first connection wins: a second
//! socket is refused with 409 until the holder disconnects or goes idle
//! past the sliding inactivity window.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;
use thiserror::Error;

/// Sliding inactivity window for the lock-holding session.
pub const SESSION_INACTIVITY: Duration = Duration::from_secs(60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// Secret configured and missing/wrong — HTTP 401.
    #[error("invalid or missing API secret")]
    Unauthorized,
    /// First-connection-wins lock is held — HTTP 409.
    #[error("another client session is active")]
    Conflict,
}

struct ActiveSession {
    token: String,
    origin: Option<String>,
    remote_addr: SocketAddr,
    last_activity: Instant,
}

impl ActiveSession {
    fn expired(&self, window: Duration) -> bool {
        self.last_activity.elapsed() > window
    }
}

pub struct SessionGate {
    api_secret: Option<String>,
    inactivity: Duration,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionGate {
    pub fn new(api_secret: Option<String>) -> Self {
        Self {
            api_secret,
            inactivity: SESSION_INACTIVITY,
            active: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_inactivity(api_secret: Option<String>, inactivity: Duration) -> Self {
        Self {
            api_secret,
            inactivity,
            active: Mutex::new(None),
        }
    }

    /// Pre-upgrade admission check. On success returns the session token the
    /// connection runs under.
    pub fn acquire(
        &self,
        secret: Option<&str>,
        origin: Option<&str>,
        remote_addr: SocketAddr,
    ) -> Result<String, SessionError> {
        if let Some(expected) = &self.api_secret {
            // Secret-enforced mode has no exclusive lock.
            return if secret == Some(expected.as_str()) {
                Ok(new_token())
            } else {
                Err(SessionError::Unauthorized)
            };
        }

        let mut active = self.active.lock().expect("session lock poisoned");
        if let Some(session) = active.as_ref() {
            if !session.expired(self.inactivity) {
                return Err(SessionError::Conflict);
            }
        }
        let token = new_token();
        *active = Some(ActiveSession {
            token: token.clone(),
            origin: origin.map(str::to_string),
            remote_addr,
            last_activity: Instant::now(),
        });
        Ok(token)
    }

    /// Slide the inactivity window and verify the token still belongs to
    /// this `(origin, remote_addr)`. An absent origin (CLI clients)
    /// bypasses the origin check.
    pub fn touch(&self, token: &str, origin: Option<&str>, remote_addr: SocketAddr) -> bool {
        if self.api_secret.is_some() {
            return true;
        }
        let mut active = self.active.lock().expect("session lock poisoned");
        let Some(session) = active.as_mut() else {
            return false;
        };
        if session.token != token || session.remote_addr != remote_addr {
            return false;
        }
        if let (Some(bound), Some(seen)) = (session.origin.as_deref(), origin) {
            if bound != seen {
                return false;
            }
        }
        session.last_activity = Instant::now();
        true
    }

    /// Release the lock if `token` holds it.
    pub fn release(&self, token: &str) {
        if self.api_secret.is_some() {
            return;
        }
        let mut active = self.active.lock().expect("session lock poisoned");
        if active.as_ref().is_some_and(|s| s.token == token) {
            *active = None;
        }
    }
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn secret_mode_checks_the_secret() {
        let gate = SessionGate::new(Some("hunter2".into()));
        assert_eq!(
            gate.acquire(None, None, addr(1)),
            Err(SessionError::Unauthorized)
        );
        assert_eq!(
            gate.acquire(Some("wrong"), None, addr(1)),
            Err(SessionError::Unauthorized)
        );
        assert!(gate.acquire(Some("hunter2"), None, addr(1)).is_ok());
        // No exclusive lock in secret mode.
        assert!(gate.acquire(Some("hunter2"), None, addr(2)).is_ok());
    }

    #[test]
    fn first_connection_wins() {
        let gate = SessionGate::new(None);
        let token = gate.acquire(None, None, addr(1)).unwrap();
        assert_eq!(gate.acquire(None, None, addr(2)), Err(SessionError::Conflict));
        gate.release(&token);
        assert!(gate.acquire(None, None, addr(2)).is_ok());
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let gate = SessionGate::with_inactivity(None, Duration::from_millis(10));
        let _stale = gate.acquire(None, None, addr(1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(gate.acquire(None, None, addr(2)).is_ok());
    }

    #[test]
    fn touch_slides_and_validates_binding() {
        let gate = SessionGate::with_inactivity(None, Duration::from_millis(50));
        let token = gate
            .acquire(None, Some("http://localhost"), addr(1))
            .unwrap();
        assert!(gate.touch(&token, Some("http://localhost"), addr(1)));
        assert!(!gate.touch(&token, Some("http://evil"), addr(1)), "origin mismatch");
        assert!(!gate.touch(&token, Some("http://localhost"), addr(2)), "addr mismatch");
        assert!(!gate.touch("bogus", None, addr(1)), "token mismatch");
        // Absent origin bypasses the origin check.
        assert!(gate.touch(&token, None, addr(1)));
    }

    #[test]
    fn tokens_are_long_and_unique() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
