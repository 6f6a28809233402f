//! Short-lived memory of numbers that discovery could not resolve.
//!
//! Message sends to a phone-number-only recipient normally trigger a
//! one-off lookup. If that number was marked undiscoverable moments ago,
//! asking again only burns quota, so senders can consult this cache first.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::discovery::E164;

/// Numbers recently marked undiscoverable, with the instant they were marked.
#[derive(Debug)]
pub struct UndiscoverableCache {
    ttl: Duration,
    entries: Mutex<HashMap<E164, DateTime<Utc>>>,
}

impl UndiscoverableCache {
    /// Creates an empty cache whose entries expire after `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records numbers as undiscoverable at `at`. Entries expired by then
    /// are pruned.
    pub fn mark_undiscoverable<'a>(
        &self,
        numbers: impl IntoIterator<Item = &'a E164>,
        at: DateTime<Utc>,
    ) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, at);
        for number in numbers {
            entries.insert(number.clone(), at);
        }
    }

    /// Forgets numbers that were found.
    pub fn mark_discovered<'a>(&self, numbers: impl IntoIterator<Item = &'a E164>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for number in numbers {
            entries.remove(number);
        }
    }

    /// Returns the numbers marked undiscoverable within the TTL.
    #[must_use]
    pub fn recently_undiscoverable(&self, numbers: &[E164]) -> Vec<E164> {
        self.recently_undiscoverable_at(numbers, Utc::now())
    }

    /// Same as [`recently_undiscoverable`](Self::recently_undiscoverable),
    /// evaluated at `now`. Expired entries are pruned.
    #[must_use]
    pub fn recently_undiscoverable_at(&self, numbers: &[E164], now: DateTime<Utc>) -> Vec<E164> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.prune(&mut entries, now);

        numbers
            .iter()
            .filter(|number| entries.contains_key(*number))
            .cloned()
            .collect()
    }

    /// Returns the number of tracked entries, expired or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Returns whether nothing is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, entries: &mut HashMap<E164, DateTime<Utc>>, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        entries.retain(|_, marked_at| now.signed_duration_since(*marked_at) < ttl);
    }
}
