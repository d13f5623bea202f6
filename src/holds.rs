use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::MAX_HOLDS;
use crate::model::{Hold, Minute, Ms};

/// Mutual-exclusion key: one live hold per slot start per date.
pub type HoldKey = (NaiveDate, Minute);

#[derive(Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was free (or its hold had expired) — this hold now owns it.
    Placed,
    /// The same holder already owned the key; the deadline was extended
    /// and the original token is returned.
    Refreshed(Ulid),
    /// A different holder owns a live hold on the key.
    Held,
}

/// Transient store for in-flight reservation holds.
///
/// `put_if_absent` must be an atomic check-then-set — a plain get-then-put
/// race here is a correctness bug. Reads reconcile expiry: a record past
/// its `expires_at` is treated as absent even before the reaper runs.
pub trait HoldStore: Send + Sync {
    fn put_if_absent(&self, hold: Hold, now: Ms) -> Result<PutOutcome, EngineError>;

    /// Raw lookup by token, including expired records — the coordinator
    /// distinguishes "expired" from "never existed".
    fn get_by_token(&self, token: Ulid) -> Result<Option<Hold>, EngineError>;

    fn remove_by_token(&self, token: Ulid) -> Result<Option<Hold>, EngineError>;

    /// Live (unexpired) holds for a date.
    fn live_for_date(&self, date: NaiveDate, now: Ms) -> Result<Vec<Hold>, EngineError>;

    /// Expired holds still occupying keys, for the reaper.
    fn collect_expired(&self, now: Ms) -> Vec<Hold>;

    /// All holds, live or not, for WAL compaction.
    fn all(&self) -> Vec<Hold>;
}

// ── Default in-memory implementation ─────────────────────────────

/// DashMap-backed store. Atomicity of `put_if_absent` comes from the
/// shard lock held by the entry API for the duration of the decision.
pub struct MemoryHoldStore {
    by_key: DashMap<HoldKey, Hold>,
    by_token: DashMap<Ulid, HoldKey>,
}

impl Default for MemoryHoldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHoldStore {
    pub fn new() -> Self {
        Self {
            by_key: DashMap::new(),
            by_token: DashMap::new(),
        }
    }

    /// Replay-time insertion: last writer wins, no expiry check here —
    /// loads of stale records are reconciled on read.
    pub fn apply_placed(&self, hold: Hold) {
        let key = (hold.date, hold.slot);
        if let Some(prev) = self.by_key.insert(key, hold.clone()) {
            self.by_token.remove(&prev.token);
        }
        self.by_token.insert(hold.token, key);
    }
}

impl HoldStore for MemoryHoldStore {
    fn put_if_absent(&self, hold: Hold, now: Ms) -> Result<PutOutcome, EngineError> {
        if self.by_key.len() >= MAX_HOLDS {
            return Err(EngineError::LimitExceeded("too many live holds"));
        }
        let key = (hold.date, hold.slot);
        match self.by_key.entry(key) {
            Entry::Vacant(slot) => {
                self.by_token.insert(hold.token, key);
                slot.insert(hold);
                Ok(PutOutcome::Placed)
            }
            Entry::Occupied(mut slot) => {
                let expired = slot.get().is_expired(now);
                let same_holder = slot.get().holder == hold.holder;
                let existing_token = slot.get().token;
                if expired {
                    self.by_token.remove(&existing_token);
                    self.by_token.insert(hold.token, key);
                    slot.insert(hold);
                    Ok(PutOutcome::Placed)
                } else if same_holder {
                    // Re-entrant: same holder refreshes their own hold
                    // (page refresh mid-checkout), keeping the token.
                    slot.get_mut().expires_at = hold.expires_at;
                    Ok(PutOutcome::Refreshed(existing_token))
                } else {
                    Ok(PutOutcome::Held)
                }
            }
        }
    }

    fn get_by_token(&self, token: Ulid) -> Result<Option<Hold>, EngineError> {
        let Some(key) = self.by_token.get(&token).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.by_key.get(&key).map(|e| e.value().clone()))
    }

    fn remove_by_token(&self, token: Ulid) -> Result<Option<Hold>, EngineError> {
        let Some((_, key)) = self.by_token.remove(&token) else {
            return Ok(None);
        };
        // The key may have been re-claimed by a newer hold after ours
        // expired — only remove if the token still matches.
        if let Some(entry) = self.by_key.get(&key)
            && entry.value().token != token
        {
            return Ok(None);
        }
        Ok(self.by_key.remove(&key).map(|(_, hold)| hold))
    }

    fn live_for_date(&self, date: NaiveDate, now: Ms) -> Result<Vec<Hold>, EngineError> {
        let mut holds: Vec<Hold> = self
            .by_key
            .iter()
            .filter(|e| e.key().0 == date && !e.value().is_expired(now))
            .map(|e| e.value().clone())
            .collect();
        holds.sort_by_key(|h| h.slot);
        Ok(holds)
    }

    fn collect_expired(&self, now: Ms) -> Vec<Hold> {
        self.by_key
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.value().clone())
            .collect()
    }

    fn all(&self) -> Vec<Hold> {
        self.by_key.iter().map(|e| e.value().clone()).collect()
    }
}
