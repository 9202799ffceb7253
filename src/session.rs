//! Per-session conversation state.
//!
//! Each session owns its ChatTurn history behind a `tokio::sync::Mutex`;
//! the orchestrator holds that lock for a whole call, so two requests on
//! the same session run one after the other while different sessions
//! never contend. Sessions idle for longer than the TTL are evicted the
//! next time the store is accessed.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use iiot_assistant_core::models::ChatTurn;
use tokio::sync::Mutex;

#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub history: Vec<ChatTurn>,
    pub last_active: Instant,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            history: Vec::new(),
            last_active: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Drop the oldest user/assistant exchanges until at most `max_turns`
    /// remain. `0` means no limit.
    pub fn trim_history(&mut self, max_turns: usize) {
        if max_turns == 0 {
            return;
        }
        let limit = max_turns * 2;
        if self.history.len() > limit {
            let excess = self.history.len() - limit;
            self.history.drain(..excess);
            tracing::debug!(session = %self.id, dropped = excess, "history trimmed");
        }
    }
}

pub type SessionHandle = Arc<Mutex<Session>>;

struct Slot {
    session: SessionHandle,
    last_seen: Instant,
}

pub struct SessionStore {
    sessions: RwLock<HashMap<String, Slot>>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_ttl,
        }
    }

    /// Session for `id`, created on first use. `None` yields a fresh
    /// one-shot session that is not stored.
    pub fn get_or_create(&self, id: Option<&str>) -> SessionHandle {
        let Some(id) = id.map(str::trim).filter(|s| !s.is_empty()) else {
            let one_shot = uuid::Uuid::new_v4().to_string();
            return Arc::new(Mutex::new(Session::new(one_shot)));
        };

        let now = Instant::now();
        let mut sessions = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.evict_idle(&mut sessions, now);
        let slot = sessions.entry(id.to_string()).or_insert_with(|| {
            tracing::debug!(session = %id, "session created");
            Slot {
                session: Arc::new(Mutex::new(Session::new(id))),
                last_seen: now,
            }
        });
        slot.last_seen = now;
        slot.session.clone()
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(id).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(id).is_some(),
        }
    }

    pub fn len(&self) -> usize {
        match self.sessions.read() {
            Ok(sessions) => sessions.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_idle(&self, sessions: &mut HashMap<String, Slot>, now: Instant) {
        let before = sessions.len();
        sessions.retain(|_, slot| {
            // a session in use (locked or referenced elsewhere) is never idle
            Arc::strong_count(&slot.session) > 1
                || now.duration_since(slot.last_seen) < self.idle_ttl
        });
        let evicted = before - sessions.len();
        if evicted > 0 {
            tracing::debug!(evicted, "idle sessions evicted");
        }
    }
}
