//! Lookup request construction.
//!
//! Decides which numbers are new (and cost quota) and which were already
//! acknowledged under the persisted token.
//!
//! | Mode | State | `new_e164s` | `prev_e164s` | `token` |
//! |------|-------|-------------|--------------|---------|
//! | One-off | ignored | targets | empty | none |
//! | Incremental | absent or invalid | targets | empty | none |
//! | Incremental | present | targets minus known | known | stored |
//!
//! Access keys are attached in every case; they never influence the
//! partitioning.

use std::collections::BTreeSet;

use super::state::DiscoveryStateStore;
use super::types::{AccessKey, Aci, DiscoveryMode, LookupRequest, E164};

/// Source of ACI/access-key pairs for known contacts.
pub trait AccessKeyProvider: Send + Sync {
    /// Returns every locally known ACI with a derivable access key.
    fn aci_access_keys(&self) -> Vec<(Aci, AccessKey)>;
}

/// Fixed list of access keys.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessKeys(pub Vec<(Aci, AccessKey)>);

impl AccessKeyProvider for StaticAccessKeys {
    fn aci_access_keys(&self) -> Vec<(Aci, AccessKey)> {
        self.0.clone()
    }
}

/// Builds a [`LookupRequest`] for `targets`.
///
/// In [`DiscoveryMode::OneOff`] the state store is never read.
#[must_use]
pub fn build_request(
    targets: &BTreeSet<E164>,
    mode: DiscoveryMode,
    state: &dyn DiscoveryStateStore,
    access_keys: &dyn AccessKeyProvider,
) -> LookupRequest {
    let prior = if mode.uses_persisted_state() {
        state.load()
    } else {
        None
    };

    let (new_e164s, prev_e164s, token) = match prior {
        Some(prior) => {
            let new_e164s = targets.difference(&prior.known_e164s).cloned().collect();
            (new_e164s, prior.known_e164s, Some(prior.token))
        }
        None => (targets.clone(), BTreeSet::new(), None),
    };

    let request = LookupRequest {
        new_e164s,
        prev_e164s,
        access_keys: access_keys.aci_access_keys(),
        token,
    };

    tracing::debug!(
        ?mode,
        new = request.new_e164s.len(),
        prev = request.prev_e164s.len(),
        access_keys = request.access_keys.len(),
        has_token = request.has_token(),
        "Built lookup request"
    );

    request
}
