//! RTSP session bookkeeping (RFC 2326 §3, §12.37).
//!
//! A session is created by SETUP against one camera's mount and destroyed
//! by TEARDOWN, by its connection dropping, or by going silent for longer
//! than its timeout.
//!
//! ```text
//! SETUP          -> Ready
//! PLAY           -> Playing
//! PAUSE          -> Paused   (from Playing)
//! PLAY           -> Playing  (from Paused)
//! TEARDOWN       -> (removed)
//! disconnect     -> (removed)
//! idle > timeout -> (removed)
//! ```

pub mod transport;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
pub use transport::Transport;

/// Advertised in the `Session` header; idle sessions are reclaimed after it.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    Playing,
    Paused,
}

#[derive(Debug)]
pub struct Session {
    /// 16-character uppercase hex identifier.
    pub id: String,
    /// Request URI of the SETUP that created this session.
    pub uri: String,
    pub transport: RwLock<Option<Transport>>,
    pub state: RwLock<SessionState>,
    pub timeout_secs: u64,
    last_activity: Mutex<Instant>,
}

impl Session {
    fn new(id: String, uri: &str) -> Self {
        Session {
            id,
            uri: uri.to_string(),
            transport: RwLock::new(None),
            state: RwLock::new(SessionState::Ready),
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn set_transport(&self, transport: Transport) {
        tracing::debug!(session_id = %self.id, client_addr = %transport.client_addr, "transport configured");
        *self.transport.write() = Some(transport);
    }

    pub fn get_transport(&self) -> Option<Transport> {
        self.transport.read().clone()
    }

    pub fn set_state(&self, state: SessionState) {
        let mut current = self.state.write();
        tracing::debug!(session_id = %self.id, old_state = ?*current, new_state = ?state, "state transition");
        *current = state;
    }

    pub fn get_state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_playing(&self) -> bool {
        *self.state.read() == SessionState::Playing
    }

    /// Record client activity, postponing expiry.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    /// `Session` header value, e.g. `0000000000000001;timeout=60`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.id, self.timeout_secs)
    }
}

/// Registry of live sessions across all cameras and connections.
///
/// Cloning shares the registry. RTP fan-out reads it on every frame.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    next_id: Arc<AtomicU64>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(rand::random::<u32>() as u64)),
        }
    }

    pub fn create_session(&self, uri: &str) -> Arc<Session> {
        let id = format!("{:016X}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let session = Arc::new(Session::new(id.clone(), uri));

        let total = {
            let mut sessions = self.sessions.write();
            sessions.insert(id.clone(), session.clone());
            sessions.len()
        };
        tracing::debug!(session_id = %id, uri, total_sessions = total, "session created");

        session
    }

    pub fn get_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    /// Look up a session and mark it active.
    pub fn lookup(&self, id: &str) -> Result<Arc<Session>> {
        let session = self
            .get_session(id)
            .ok_or_else(|| Error::SessionNotFound(id.to_string()))?;
        session.touch();
        Ok(session)
    }

    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(id);
        if removed.is_some() {
            tracing::debug!(session_id = %id, total_sessions = sessions.len(), "session removed");
        }
        removed
    }

    /// Remove several sessions at once. Returns how many existed.
    pub fn remove_sessions(&self, ids: &[String]) -> usize {
        let mut sessions = self.sessions.write();
        let removed = ids.iter().filter(|id| sessions.remove(*id).is_some()).count();
        if removed > 0 {
            tracing::debug!(removed, remaining = sessions.len(), "batch session cleanup");
        }
        removed
    }

    /// IDs of sessions idle for longer than their timeout.
    pub fn expired_sessions(&self) -> Vec<String> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.idle_for() > Duration::from_secs(s.timeout_secs))
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn get_playing_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .values()
            .filter(|s| s.is_playing())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        sessions.clear();
        count
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}
