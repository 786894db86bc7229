//! In-memory conversation ledger.
//!
//! Each conversation is an append-only list of [`Turn`]s, created lazily on
//! first append and kept for the life of the process. Nothing is persisted.
//!
//! The store is owned by the server state and shared behind an `Arc`; a
//! single store-wide mutex serializes appends, and it is never held across an
//! `.await`.
//!
//! # Lifecycle policy
//!
//! | Setting | Effect |
//! |---------|--------|
//! | `max_conversations` | least-recently-used conversation is evicted when exceeded |
//! | `max_turns` | oldest turns of a conversation are dropped when exceeded |
//! | `idle_ttl` | conversations untouched for this long are expired |
//!
//! All three are off by default, in which case the store grows without bound.
//!
//! A conversation with an exchange in flight (between
//! [`ConversationStore::begin_exchange`] and
//! [`ConversationStore::end_exchange`]) is pinned: it is neither expired nor
//! evicted, so its user turn is still there when the answer arrives.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::ConversationConfig;
use crate::models::{Role, Turn};

/// Bounds applied by a [`ConversationStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerPolicy {
    pub max_conversations: Option<usize>,
    pub max_turns: Option<usize>,
    pub idle_ttl: Option<Duration>,
}

impl From<&ConversationConfig> for LedgerPolicy {
    fn from(config: &ConversationConfig) -> Self {
        Self {
            max_conversations: config.max_conversations,
            max_turns: config.max_turns,
            idle_ttl: config.idle_ttl_secs.map(Duration::from_secs),
        }
    }
}

impl LedgerPolicy {
    pub fn is_unbounded(&self) -> bool {
        self.max_conversations.is_none() && self.max_turns.is_none() && self.idle_ttl.is_none()
    }
}

struct Conversation {
    turns: Vec<Turn>,
    next_seq: u64,
    last_access: Instant,
    /// Exchanges currently running against this conversation.
    in_flight: usize,
}

impl Conversation {
    fn new(now: Instant) -> Self {
        Self {
            turns: Vec::new(),
            next_seq: 0,
            last_access: now,
            in_flight: 0,
        }
    }

    fn is_pinned(&self) -> bool {
        self.in_flight > 0
    }
}

/// Process-lifetime store of conversation ledgers, keyed by conversation id.
pub struct ConversationStore {
    policy: LedgerPolicy,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new(policy: LedgerPolicy) -> Self {
        Self {
            policy,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    /// Unbounded store.
    pub fn unbounded() -> Self {
        Self::new(LedgerPolicy::default())
    }

    /// Append a turn, creating the conversation if needed.
    ///
    /// Returns the sequence number assigned to the new turn.
    pub fn append(&self, conversation_id: &str, role: Role, content: impl Into<String>) -> u64 {
        let mut map = self.conversations.lock();
        self.append_locked(&mut map, conversation_id, role, content.into())
    }

    /// Append the user turn that opens an exchange and pin the conversation
    /// until the matching [`end_exchange`](Self::end_exchange).
    pub fn begin_exchange(&self, conversation_id: &str, question: impl Into<String>) -> u64 {
        let mut map = self.conversations.lock();
        let seq = self.append_locked(&mut map, conversation_id, Role::User, question.into());
        if let Some(conv) = map.get_mut(conversation_id) {
            conv.in_flight += 1;
        }
        seq
    }

    /// Release the pin taken by [`begin_exchange`](Self::begin_exchange).
    pub fn end_exchange(&self, conversation_id: &str) {
        let mut map = self.conversations.lock();
        if let Some(conv) = map.get_mut(conversation_id) {
            conv.in_flight = conv.in_flight.saturating_sub(1);
            conv.last_access = Instant::now();
        }
    }

    fn append_locked(
        &self,
        map: &mut HashMap<String, Conversation>,
        conversation_id: &str,
        role: Role,
        content: String,
    ) -> u64 {
        let now = Instant::now();
        self.expire_idle(map, now);

        if !map.contains_key(conversation_id) {
            self.make_room(map);
        }

        let conv = map
            .entry(conversation_id.to_string())
            .or_insert_with(|| Conversation::new(now));

        let seq = conv.next_seq;
        conv.next_seq += 1;
        conv.last_access = now;
        conv.turns.push(Turn {
            seq,
            role,
            content,
            created_at: Utc::now(),
        });

        if let Some(max) = self.policy.max_turns {
            if conv.turns.len() > max {
                let excess = conv.turns.len() - max;
                conv.turns.drain(..excess);
                debug!(conversation_id, dropped = excess, "trimmed conversation turns");
            }
        }

        seq
    }

    /// Up to `limit` most recent turns that precede turn `before_seq`.
    ///
    /// Turns appended after `before_seq` (by concurrent requests on the same
    /// conversation) are not included either.
    pub fn history_before(&self, conversation_id: &str, before_seq: u64, limit: usize) -> Vec<Turn> {
        let mut map = self.conversations.lock();
        let Some(conv) = map.get_mut(conversation_id) else {
            return Vec::new();
        };
        conv.last_access = Instant::now();

        let earlier: Vec<&Turn> = conv.turns.iter().filter(|t| t.seq < before_seq).collect();
        let start = earlier.len().saturating_sub(limit);
        earlier[start..].iter().map(|t| (*t).clone()).collect()
    }

    /// All turns currently held for a conversation.
    pub fn turns(&self, conversation_id: &str) -> Vec<Turn> {
        self.conversations
            .lock()
            .get(conversation_id)
            .map(|c| c.turns.clone())
            .unwrap_or_default()
    }

    /// Remove a single turn by sequence number. Returns whether it was present.
    pub fn retract(&self, conversation_id: &str, seq: u64) -> bool {
        let mut map = self.conversations.lock();
        let Some(conv) = map.get_mut(conversation_id) else {
            return false;
        };
        let before = conv.turns.len();
        conv.turns.retain(|t| t.seq != seq);
        conv.turns.len() != before
    }

    pub fn contains(&self, conversation_id: &str) -> bool {
        self.conversations.lock().contains_key(conversation_id)
    }

    /// Number of live conversations.
    pub fn len(&self) -> usize {
        self.conversations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expire_idle(&self, map: &mut HashMap<String, Conversation>, now: Instant) {
        let Some(ttl) = self.policy.idle_ttl else {
            return;
        };
        let before = map.len();
        map.retain(|_, c| c.is_pinned() || now.duration_since(c.last_access) < ttl);
        let expired = before - map.len();
        if expired > 0 {
            debug!(expired, "expired idle conversations");
        }
    }

    fn make_room(&self, map: &mut HashMap<String, Conversation>) {
        let Some(max) = self.policy.max_conversations else {
            return;
        };
        while map.len() >= max {
            let oldest = map
                .iter()
                .filter(|(_, c)| !c.is_pinned())
                .min_by_key(|(_, c)| c.last_access)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    map.remove(&id);
                    debug!(conversation_id = %id, "evicted least-recently-used conversation");
                }
                // Everything left is pinned; allow the overshoot.
                None => break,
            }
        }
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::unbounded()
    }
}
