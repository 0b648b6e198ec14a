//! Per-user rolling claim history.
//!
//! The store is owned by the caller and passed into verification. Each user
//! has their own lock, so evaluating a claim against the latest entry and
//! appending it happen atomically for that user without serializing
//! unrelated users.
//!
//! A user's entry lives until [`LocationHistoryStore::clear`] or
//! [`LocationHistoryStore::prune_idle`] removes it. The owner of the store
//! decides how often to prune.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};

use crate::error::{DropError, DropResult};
use crate::location::types::LocationClaim;

/// Default number of claims kept per user.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

type UserHistory = Arc<Mutex<VecDeque<LocationClaim>>>;

/// Bounded per-user history of accepted claims.
#[derive(Debug)]
pub struct LocationHistoryStore {
    users: RwLock<HashMap<String, UserHistory>>,
    limit: usize,
}

impl Default for LocationHistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl LocationHistoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn user_entry(&self, user_id: &str) -> DropResult<UserHistory> {
        {
            let users = self
                .users
                .read()
                .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;
            if let Some(entry) = users.get(user_id) {
                return Ok(Arc::clone(entry));
            }
        }

        let mut users = self
            .users
            .write()
            .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;
        Ok(Arc::clone(users.entry(user_id.to_string()).or_default()))
    }

    /// Run `f` with exclusive access to one user's history.
    ///
    /// Entries pushed by `f` beyond the limit are evicted oldest-first.
    pub fn with_user<T>(
        &self,
        user_id: &str,
        f: impl FnOnce(&mut VecDeque<LocationClaim>) -> T,
    ) -> DropResult<T> {
        let entry = self.user_entry(user_id)?;
        let mut history = entry
            .lock()
            .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;

        let out = f(&mut history);
        while history.len() > self.limit {
            history.pop_front();
        }
        Ok(out)
    }

    /// Copy of a user's history, oldest first.
    pub fn snapshot(&self, user_id: &str) -> DropResult<Vec<LocationClaim>> {
        self.with_user(user_id, |history| history.iter().cloned().collect())
    }

    /// Number of users with an entry.
    pub fn user_count(&self) -> DropResult<usize> {
        let users = self
            .users
            .read()
            .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;
        Ok(users.len())
    }

    /// Forget users whose latest claim is older than `cutoff`, and users with
    /// no claims. Entries in use by a concurrent call are kept. Returns the
    /// number of users removed.
    pub fn prune_idle(&self, cutoff: DateTime<Utc>) -> DropResult<usize> {
        let mut users = self
            .users
            .write()
            .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;

        let before = users.len();
        users.retain(|_, entry| {
            // Clones are only taken under the map lock
            if Arc::strong_count(entry) > 1 {
                return true;
            }
            entry.lock().is_ok_and(|history| {
                history.back().is_some_and(|latest| latest.timestamp >= cutoff)
            })
        });
        let removed = before - users.len();

        if removed > 0 {
            tracing::debug!(removed, remaining = users.len(), "Pruned idle location histories");
        }
        Ok(removed)
    }

    /// Forget a user's history.
    pub fn clear(&self, user_id: &str) -> DropResult<()> {
        let mut users = self
            .users
            .write()
            .map_err(|_| DropError::Internal("history lock poisoned".to_string()))?;
        users.remove(user_id);
        Ok(())
    }
}
