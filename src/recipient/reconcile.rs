//! Merges lookup results into the recipient store.
//!
//! Matches are merged and flagged discoverable and registered. Requested
//! numbers without a match are flagged undiscoverable; a recipient is only
//! marked unregistered when it has no ACI or PNI on file, since a miss by
//! phone number says nothing about an account known by stable ID.
//!
//! Work is split into batches with a yield between them so a large contact
//! list does not monopolize the store.

use std::collections::{BTreeSet, HashSet};

use chrono::Utc;

use super::error::Result;
use super::storage::RecipientStore;
use super::types::Recipient;
use super::undiscoverable::UndiscoverableCache;
use crate::discovery::{LookupResult, E164};

/// Default number of recipients handled per batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Applies lookup results to a [`RecipientStore`].
pub struct Reconciler<'a> {
    store: &'a dyn RecipientStore,
    batch_size: usize,
    undiscoverable: Option<&'a UndiscoverableCache>,
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler over `store`.
    #[must_use]
    pub fn new(store: &'a dyn RecipientStore) -> Self {
        Self {
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            undiscoverable: None,
        }
    }

    /// Sets the batch size. Zero is treated as one.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Records undiscoverable numbers in `cache`.
    #[must_use]
    pub const fn with_undiscoverable_cache(mut self, cache: &'a UndiscoverableCache) -> Self {
        self.undiscoverable = Some(cache);
        self
    }

    /// Merges `results` and demotes requested numbers without a match.
    ///
    /// Returns the recipients for matched numbers that were in `requested`.
    /// Matches for numbers outside `requested` (carried along by an
    /// incremental token) are merged but not returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails. Batches already written stay
    /// written; rerunning with the same input converges to the same state.
    pub async fn reconcile(
        &self,
        requested: &BTreeSet<E164>,
        results: &[LookupResult],
    ) -> Result<HashSet<Recipient>> {
        let mut registered = HashSet::new();

        for batch in results.chunks(self.batch_size) {
            for result in batch {
                let recipient = self.merge_match(result)?;
                if requested.contains(&result.e164) {
                    registered.insert(recipient);
                }
            }
            tokio::task::yield_now().await;
        }

        let found: HashSet<&E164> = results.iter().map(|r| &r.e164).collect();
        let missing: Vec<&E164> = requested.iter().filter(|e| !found.contains(e)).collect();

        let mut demoted = 0usize;
        for batch in missing.chunks(self.batch_size) {
            for e164 in batch {
                if self.demote(e164)? {
                    demoted += 1;
                }
            }
            tokio::task::yield_now().await;
        }

        if let Some(cache) = self.undiscoverable {
            cache.mark_discovered(found.iter().copied());
            cache.mark_undiscoverable(missing.iter().copied(), Utc::now());
        }

        tracing::info!(
            matched = results.len(),
            returned = registered.len(),
            undiscoverable = missing.len(),
            demoted,
            "Reconciled discovery results"
        );
        Ok(registered)
    }

    fn merge_match(&self, result: &LookupResult) -> Result<Recipient> {
        let mut recipient = self
            .store
            .find_or_create(result.aci, result.pni, &result.e164)?;
        recipient.is_phone_number_discoverable = true;
        recipient.is_registered = true;
        self.store.save(&recipient)?;
        Ok(recipient)
    }

    /// Flags a recipient undiscoverable. Returns whether one existed.
    fn demote(&self, e164: &E164) -> Result<bool> {
        let Some(mut recipient) = self.store.find_by_phone_number(e164)? else {
            return Ok(false);
        };

        recipient.is_phone_number_discoverable = false;
        if !recipient.has_service_id() {
            recipient.is_registered = false;
        }
        self.store.save(&recipient)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::discovery::{Aci, Pni};
    use crate::recipient::SqliteRecipientStore;

    fn e164(s: &str) -> E164 {
        E164::parse(s).unwrap()
    }

    fn pni(b: u8) -> Pni {
        Pni::from_bytes([b; 16]).unwrap()
    }

    fn result(number: &str, pni_byte: u8) -> LookupResult {
        LookupResult {
            e164: e164(number),
            pni: pni(pni_byte),
            aci: None,
        }
    }

    #[tokio::test]
    async fn matches_are_registered_and_returned() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let requested = BTreeSet::from([e164("+15550001")]);

        let returned = Reconciler::new(&store)
            .reconcile(&requested, &[result("+15550001", 1)])
            .await
            .unwrap();

        assert_eq!(returned.len(), 1);
        let recipient = returned.into_iter().next().unwrap();
        assert_eq!(recipient.pni, Some(pni(1)));
        assert!(recipient.is_registered);
        assert!(recipient.is_phone_number_discoverable);
    }

    #[tokio::test]
    async fn unrequested_matches_are_merged_but_not_returned() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let requested = BTreeSet::from([e164("+15550001")]);

        let returned = Reconciler::new(&store)
            .reconcile(&requested, &[result("+15550001", 1), result("+15550009", 9)])
            .await
            .unwrap();

        assert_eq!(returned.len(), 1);
        let carried = store.find_by_phone_number(&e164("+15550009")).unwrap().unwrap();
        assert!(carried.is_registered);
    }

    #[tokio::test]
    async fn phone_only_recipient_is_demoted_fully() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let existing = store
            .insert(&Recipient::with_phone_number(e164("+15550002")).registered(true))
            .unwrap();

        Reconciler::new(&store)
            .reconcile(&BTreeSet::from([e164("+15550002")]), &[])
            .await
            .unwrap();

        let demoted = store.get(existing.id).unwrap().unwrap();
        assert!(!demoted.is_phone_number_discoverable);
        assert!(!demoted.is_registered);
    }

    #[tokio::test]
    async fn recipient_with_aci_keeps_registration() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let mut existing = Recipient::with_phone_number(e164("+15550003"))
            .with_aci(Aci::from_bytes([3; 16]).unwrap())
            .registered(true);
        existing.is_phone_number_discoverable = true;
        let existing = store.insert(&existing).unwrap();

        Reconciler::new(&store)
            .reconcile(&BTreeSet::from([e164("+15550003")]), &[])
            .await
            .unwrap();

        let demoted = store.get(existing.id).unwrap().unwrap();
        assert!(!demoted.is_phone_number_discoverable);
        assert!(demoted.is_registered);
    }

    #[tokio::test]
    async fn unknown_missing_numbers_are_not_created() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        Reconciler::new(&store)
            .reconcile(&BTreeSet::from([e164("+15550004")]), &[])
            .await
            .unwrap();
        assert!(store.all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn small_batches_produce_same_result() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let requested: BTreeSet<E164> = (1..=5).map(|i| e164(&format!("+1555000{i}"))).collect();
        let results: Vec<LookupResult> = (1..=3)
            .map(|i| result(&format!("+1555000{i}"), i))
            .collect();

        let returned = Reconciler::new(&store)
            .with_batch_size(2)
            .reconcile(&requested, &results)
            .await
            .unwrap();

        assert_eq!(returned.len(), 3);
        assert_eq!(store.all().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn cache_tracks_undiscoverable_numbers() {
        let store = SqliteRecipientStore::in_memory().unwrap();
        let cache = UndiscoverableCache::new(Duration::from_secs(3600));
        let requested = BTreeSet::from([e164("+15550001"), e164("+15550002")]);

        Reconciler::new(&store)
            .with_undiscoverable_cache(&cache)
            .reconcile(&requested, &[result("+15550001", 1)])
            .await
            .unwrap();

        assert_eq!(
            cache.recently_undiscoverable(&[e164("+15550001"), e164("+15550002")]),
            vec![e164("+15550002")]
        );
    }
}
