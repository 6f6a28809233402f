//! Reusable test helpers for discovery integration tests.
//!
//! [`FakeDirectory`] models the directory service closely enough to check
//! quota accounting: it issues a fresh token per lookup, remembers which
//! numbers each token covers, bills only numbers a valid token does not
//! already cover, and rejects tokens it never issued with a 4101 close.
//! Faults can be queued to interrupt a specific round trip.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cds_core::discovery::{
    Aci, ConnectionError, DirectoryConnection, DirectoryConnector, DiscoveryStateStore,
    LookupRequest, PersistedTokenHandle, Pni, ResultEntry, SqliteDiscoveryStateStore,
    StaticAccessKeys, TokenHandle, CLOSE_INVALID_TOKEN, E164,
};
use cds_core::recipient::{RecipientStore, SqliteRecipientStore};
use cds_core::{DiscoveryConfig, DiscoveryManager};

/// Parses a number, panicking on bad test input.
pub fn e164(s: &str) -> E164 {
    E164::parse(s).expect("valid test number")
}

/// Builds a PNI whose bytes are all `b`.
pub fn pni(b: u8) -> Pni {
    Pni::from_bytes([b; 16]).expect("non-nil pni")
}

/// Builds an ACI whose bytes are all `b`.
pub fn aci(b: u8) -> Aci {
    Aci::from_bytes([b; 16]).expect("non-nil aci")
}

/// A fault injected into the next matching round trip.
#[derive(Debug)]
pub enum Fault {
    /// Fail the connect call.
    Connect(ConnectionError),
    /// Fail the submit step before a token is issued.
    Submit(ConnectionError),
    /// Issue an empty token.
    EmptyToken,
    /// Issue and bill the token, then fail the results step.
    Complete(ConnectionError),
}

#[derive(Default)]
struct Service {
    registry: HashMap<E164, (Pni, Option<Aci>)>,
    issued: HashMap<Vec<u8>, BTreeSet<E164>>,
    next_token: u64,
    faults: VecDeque<Fault>,
    requests: Vec<LookupRequest>,
    acked: Vec<Vec<u8>>,
    billed: usize,
    connects: usize,
    open_connections: usize,
    max_open_connections: usize,
}

impl Service {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let index = self.faults.iter().position(matches)?;
        self.faults.remove(index)
    }
}

/// In-memory directory service.
#[derive(Clone, Default)]
pub struct FakeDirectory {
    service: Arc<Mutex<Service>>,
}

impl FakeDirectory {
    /// Creates a service with no registered accounts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an account reachable by `number`.
    pub fn register(&self, number: &E164, pni: Pni, aci: Option<Aci>) {
        self.lock().registry.insert(number.clone(), (pni, aci));
    }

    /// Removes the account behind `number`.
    pub fn unregister(&self, number: &E164) {
        self.lock().registry.remove(number);
    }

    /// Queues a fault for the next round trip it applies to.
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Returns every request received, in order.
    pub fn requests(&self) -> Vec<LookupRequest> {
        self.lock().requests.clone()
    }

    /// Returns the last request received.
    pub fn last_request(&self) -> LookupRequest {
        self.lock()
            .requests
            .last()
            .cloned()
            .expect("at least one request")
    }

    /// Returns the tokens clients acknowledged, in order.
    pub fn acked_tokens(&self) -> Vec<Vec<u8>> {
        self.lock().acked.clone()
    }

    /// Returns the total numbers billed against quota.
    pub fn billed(&self) -> usize {
        self.lock().billed
    }

    /// Returns how many connections were opened.
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Returns the highest number of connections open at once.
    pub fn max_open_connections(&self) -> usize {
        self.lock().max_open_connections
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Service> {
        self.service.lock().expect("fake service lock")
    }
}

#[async_trait]
impl DirectoryConnector for FakeDirectory {
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, ConnectionError> {
        let mut service = self.lock();
        service.connects += 1;
        if let Some(Fault::Connect(err)) =
            service.take_fault(|f| matches!(f, Fault::Connect(_)))
        {
            return Err(err);
        }
        service.open_connections += 1;
        service.max_open_connections = service.max_open_connections.max(service.open_connections);
        drop(service);

        Ok(Box::new(FakeConnection {
            service: Arc::clone(&self.service),
            issued: None,
            closed: false,
        }))
    }
}

struct FakeConnection {
    service: Arc<Mutex<Service>>,
    issued: Option<Vec<u8>>,
    closed: bool,
}

impl FakeConnection {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.service.lock().expect("fake service lock").open_connections -= 1;
        }
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl DirectoryConnection for FakeConnection {
    async fn submit(&mut self, request: &LookupRequest) -> Result<TokenHandle, ConnectionError> {
        // Give concurrent runs a chance to interleave.
        tokio::task::yield_now().await;

        let mut service = self.service.lock().expect("fake service lock");
        service.requests.push(request.clone());

        match service.take_fault(|f| matches!(f, Fault::Submit(_) | Fault::EmptyToken)) {
            Some(Fault::Submit(err)) => return Err(err),
            Some(Fault::EmptyToken) => return Ok(TokenHandle::new(Vec::new())),
            _ => {}
        }

        let all = request.all_e164s();
        let billed = match &request.token {
            Some(token) => {
                let Some(covered) = service.issued.get(token.as_bytes()) else {
                    return Err(ConnectionError::Closed {
                        code: CLOSE_INVALID_TOKEN,
                        reason: None,
                    });
                };
                all.difference(covered).count()
            }
            None => all.len(),
        };
        service.billed += billed;

        service.next_token += 1;
        let token = format!("token-{}", service.next_token).into_bytes();
        service.issued.insert(token.clone(), all);
        drop(service);

        self.issued = Some(token.clone());
        Ok(TokenHandle::new(token))
    }

    async fn complete(
        &mut self,
        token: PersistedTokenHandle,
    ) -> Result<Vec<ResultEntry>, ConnectionError> {
        tokio::task::yield_now().await;

        let mut service = self.service.lock().expect("fake service lock");
        assert_eq!(
            Some(token.token().as_bytes()),
            self.issued.as_deref(),
            "client acknowledged a token this connection did not issue"
        );
        service.acked.push(token.token().as_bytes().to_vec());

        if let Some(Fault::Complete(err)) =
            service.take_fault(|f| matches!(f, Fault::Complete(_)))
        {
            return Err(err);
        }

        let covered = service
            .issued
            .get(token.token().as_bytes())
            .cloned()
            .unwrap_or_default();
        Ok(covered
            .into_iter()
            .filter_map(|e164| {
                let (pni, aci) = *service.registry.get(&e164)?;
                Some(ResultEntry {
                    e164,
                    pni: Some(pni),
                    aci,
                })
            })
            .collect())
    }

    async fn close(&mut self) {
        self.release();
    }
}

/// A manager over in-memory stores, with handles to each collaborator.
pub struct Harness {
    pub manager: DiscoveryManager,
    pub directory: FakeDirectory,
    pub state: Arc<SqliteDiscoveryStateStore>,
    pub recipients: Arc<SqliteRecipientStore>,
}

impl Harness {
    /// Builds a harness with the default configuration.
    pub fn new() -> Self {
        Self::with_config(DiscoveryConfig::default())
    }

    /// Builds a harness with `config`.
    pub fn with_config(config: DiscoveryConfig) -> Self {
        let directory = FakeDirectory::new();
        let state = Arc::new(SqliteDiscoveryStateStore::in_memory().expect("state store"));
        let recipients = Arc::new(SqliteRecipientStore::in_memory().expect("recipient store"));
        let state_store: Arc<dyn DiscoveryStateStore> = state.clone();
        let recipient_store: Arc<dyn RecipientStore> = recipients.clone();
        let manager = DiscoveryManager::new(
            state_store,
            Arc::new(directory.clone()),
            recipient_store,
            Arc::new(StaticAccessKeys(Vec::new())),
            config,
        );
        Self {
            manager,
            directory,
            state,
            recipients,
        }
    }
}
