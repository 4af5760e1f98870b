//! Per-session chat history.
//!
//! Each [`Session`] is a bounded queue of turns. Appending past either
//! bound (turn count or history tokens) evicts the oldest turns first;
//! the exchange just appended is never evicted by the token bound.
//! Sessions live in memory only and vanish on restart.
//!
//! [`SessionStore`] partitions sessions by id. The map lock is held only
//! to look a session up; each session has its own mutex, so requests for
//! different sessions never contend. The store holds at most
//! `max_sessions` entries: creating one more evicts the least recently
//! used session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crate::error::RagError;
use crate::models::Turn;
use crate::tokenize::count_tokens;

const MAX_SESSION_ID_LEN: usize = 128;

/// Reject empty, overlong, or oddly-charactered session ids.
pub fn validate_session_id(id: &str) -> Result<(), RagError> {
    if id.is_empty() || id.len() > MAX_SESSION_ID_LEN {
        return Err(RagError::InvalidInput(format!(
            "session id must be 1..={} characters",
            MAX_SESSION_ID_LEN
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(RagError::InvalidInput(format!(
            "session id '{}' may only contain letters, digits, '-', '_' and '.'",
            id
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub max_turns: usize,
    pub max_history_tokens: usize,
    pub max_sessions: usize,
}

#[derive(Debug)]
pub struct Session {
    id: String,
    limits: SessionLimits,
    turns: VecDeque<(Turn, usize)>,
    history_tokens: usize,
    documents: Vec<String>,
}

impl Session {
    pub fn new(id: impl Into<String>, limits: SessionLimits) -> Self {
        Self {
            id: id.into(),
            limits,
            turns: VecDeque::new(),
            history_tokens: 0,
            documents: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Turns oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.turns.iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn history_tokens(&self) -> usize {
        self.history_tokens
    }

    /// Documents uploaded through this session.
    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    /// Append a question and its answer, then evict oldest turns until
    /// both limits hold.
    pub fn push_exchange(&mut self, question: &str, answer: &str) {
        self.push(Turn::user(question));
        self.push(Turn::assistant(answer));
        self.evict();
    }

    pub fn record_document(&mut self, document_id: &str) {
        if !self.documents.iter().any(|d| d == document_id) {
            self.documents.push(document_id.to_string());
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
        self.history_tokens = 0;
    }

    fn push(&mut self, turn: Turn) {
        let tokens = count_tokens(&turn.text);
        self.history_tokens += tokens;
        self.turns.push_back((turn, tokens));
    }

    fn evict(&mut self) {
        while self.turns.len() > self.limits.max_turns
            || (self.history_tokens > self.limits.max_history_tokens && self.turns.len() > 2)
        {
            match self.turns.pop_front() {
                Some((_, tokens)) => self.history_tokens -= tokens,
                None => break,
            }
        }
    }
}

#[derive(Debug)]
struct Slot {
    session: Arc<Mutex<Session>>,
    last_used: AtomicU64,
}

/// All live sessions, keyed by id.
#[derive(Debug)]
pub struct SessionStore {
    limits: SessionLimits,
    sessions: RwLock<HashMap<String, Slot>>,
    clock: AtomicU64,
}

impl SessionStore {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            limits,
            sessions: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// The session for `id`, created on first use. Creating a session in
    /// a full store evicts the least recently used one.
    pub fn session(&self, id: &str) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.existing(id) {
            return existing;
        }
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if !sessions.contains_key(id) {
            while sessions.len() >= self.limits.max_sessions.max(1) {
                let oldest = sessions
                    .iter()
                    .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                    .map(|(key, _)| key.clone());
                match oldest {
                    Some(key) => {
                        sessions.remove(&key);
                    }
                    None => break,
                }
            }
        }
        let tick = self.tick();
        let slot = sessions.entry(id.to_string()).or_insert_with(|| Slot {
            session: Arc::new(Mutex::new(Session::new(id, self.limits))),
            last_used: AtomicU64::new(tick),
        });
        slot.last_used.store(tick, Ordering::Relaxed);
        Arc::clone(&slot.session)
    }

    /// History for `id`, oldest first. Empty for unknown sessions.
    pub fn history(&self, id: &str) -> Vec<Turn> {
        match self.existing(id) {
            Some(session) => lock(&session).history(),
            None => Vec::new(),
        }
    }

    pub fn append_exchange(&self, id: &str, question: &str, answer: &str) {
        let session = self.session(id);
        lock(&session).push_exchange(question, answer);
    }

    pub fn record_upload(&self, id: &str, document_id: &str) {
        let session = self.session(id);
        lock(&session).record_document(document_id);
    }

    /// Drop a session and its history. Returns `false` if it did not
    /// exist.
    pub fn reset(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        match removed {
            Some(slot) => {
                lock(&slot.session).clear();
                true
            }
            None => false,
        }
    }

    /// Documents uploaded through `id`. Empty for unknown sessions.
    pub fn uploads(&self, id: &str) -> Vec<String> {
        match self.existing(id) {
            Some(session) => lock(&session).documents().to_vec(),
            None => Vec::new(),
        }
    }

    /// Remove `document_id` from every session's upload list.
    pub fn forget_document(&self, document_id: &str) {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        for slot in sessions.values() {
            lock(&slot.session).documents.retain(|d| d != document_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let slot = sessions.get(id)?;
        slot.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&slot.session))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}

fn lock(session: &Mutex<Session>) -> MutexGuard<'_, Session> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}
