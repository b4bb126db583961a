//! At-most-once key/value store, the simple collaborator next to the
//! MapReduce core: a single mutex-guarded map plus a per-request-id result
//! cache. Mutating calls carry a client-chosen request id; replaying an id
//! returns the cached reply without touching the store again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use tarpc::context;
use tokio::time;

#[tarpc::service]
pub trait Kv {
    /// Current value for a key, empty string if absent. Read-only, not
    /// deduplicated.
    async fn get(key: String) -> String;

    /// Replace the value under `key`, returning the previous value.
    async fn put(id: u64, key: String, value: String) -> String;

    /// Concatenate `value` onto the value under `key`, returning the
    /// previous value.
    async fn append(id: u64, key: String, value: String) -> String;

    /// Client acknowledgement that the reply for `id` arrived; the cached
    /// result can be dropped.
    async fn forget(id: u64);
}

#[derive(Debug, Default)]
struct State {
    store: HashMap<String, String>,
    results: HashMap<u64, String>,
}

/// The store itself, shared by every connection's handler.
#[derive(Debug, Default)]
pub struct KvStore {
    state: Mutex<State>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    pub fn get(&self, key: &str) -> String {
        let state = self.state.lock().unwrap();
        state.store.get(key).cloned().unwrap_or_default()
    }

    pub fn put(&self, id: u64, key: String, value: String) -> String {
        self.dedup(id, |store| store.insert(key, value).unwrap_or_default())
    }

    pub fn append(&self, id: u64, key: String, value: String) -> String {
        self.dedup(id, |store| {
            let old = store.remove(&key).unwrap_or_default();
            store.insert(key, format!("{}{}", old, value));
            old
        })
    }

    pub fn forget(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.results.remove(&id);
    }

    /// Run a mutation exactly once per request id. A replayed id gets the
    /// cached reply and leaves the store untouched.
    fn dedup(&self, id: u64, op: impl FnOnce(&mut HashMap<String, String>) -> String) -> String {
        let mut state = self.state.lock().unwrap();
        if let Some(cached) = state.results.get(&id) {
            return cached.clone();
        }
        let reply = op(&mut state.store);
        state.results.insert(id, reply.clone());
        reply
    }
}

/// tarpc handler wrapping a shared [`KvStore`].
#[derive(Clone)]
pub struct KvService {
    store: Arc<KvStore>,
}

impl KvService {
    pub fn new(store: Arc<KvStore>) -> Self {
        KvService { store }
    }
}

#[tarpc::server]
impl Kv for KvService {
    async fn get(self, _: context::Context, key: String) -> String {
        self.store.get(&key)
    }

    async fn put(self, _: context::Context, id: u64, key: String, value: String) -> String {
        self.store.put(id, key, value)
    }

    async fn append(self, _: context::Context, id: u64, key: String, value: String) -> String {
        self.store.append(id, key, value)
    }

    async fn forget(self, _: context::Context, id: u64) {
        self.store.forget(id);
    }
}

const CLERK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Client wrapper that retries every call until the transport succeeds and
/// confirms receipt of mutation replies so the server can drop them. Safe
/// against duplicated deliveries because each mutation carries one id for
/// all its retries.
pub struct Clerk {
    client: KvClient,
}

impl Clerk {
    pub fn new(client: KvClient) -> Self {
        Clerk { client }
    }

    pub async fn get(&self, key: &str) -> String {
        loop {
            match self.client.get(context::current(), key.to_owned()).await {
                Ok(value) => return value,
                Err(e) => {
                    warn!("kv get failed, retrying: {}", e);
                    time::sleep(CLERK_RETRY_INTERVAL).await;
                }
            }
        }
    }

    pub async fn put(&self, key: &str, value: &str) {
        let id = rand::random::<u64>();
        loop {
            match self
                .client
                .put(context::current(), id, key.to_owned(), value.to_owned())
                .await
            {
                Ok(_) => break,
                Err(e) => {
                    warn!("kv put failed, retrying: {}", e);
                    time::sleep(CLERK_RETRY_INTERVAL).await;
                }
            }
        }
        self.confirm(id).await;
    }

    /// Returns the previous value under `key`.
    pub async fn append(&self, key: &str, value: &str) -> String {
        let id = rand::random::<u64>();
        let old = loop {
            match self
                .client
                .append(context::current(), id, key.to_owned(), value.to_owned())
                .await
            {
                Ok(old) => break old,
                Err(e) => {
                    warn!("kv append failed, retrying: {}", e);
                    time::sleep(CLERK_RETRY_INTERVAL).await;
                }
            }
        };
        self.confirm(id).await;
        old
    }

    async fn confirm(&self, id: u64) {
        loop {
            match self.client.forget(context::current(), id).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("kv forget failed, retrying: {}", e);
                    time::sleep(CLERK_RETRY_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarpc::client;
    use tarpc::server::{BaseChannel, Channel};

    #[test]
    fn replayed_put_returns_cached_reply_without_mutating() {
        let kv = KvStore::new();
        assert_eq!(kv.put(1, "k".into(), "v1".into()), "");
        // Retry of the same request: cached reply, store unchanged.
        assert_eq!(kv.put(1, "k".into(), "v2".into()), "");
        assert_eq!(kv.get("k"), "v1");
    }

    #[test]
    fn replayed_append_applies_once() {
        let kv = KvStore::new();
        assert_eq!(kv.append(7, "k".into(), "x".into()), "");
        assert_eq!(kv.append(7, "k".into(), "x".into()), "");
        assert_eq!(kv.get("k"), "x");

        assert_eq!(kv.append(8, "k".into(), "y".into()), "x");
        assert_eq!(kv.get("k"), "xy");
    }

    #[test]
    fn forget_releases_the_cached_result() {
        let kv = KvStore::new();
        kv.put(1, "k".into(), "v1".into());
        kv.forget(1);
        // The id is reusable once forgotten; this is a fresh mutation.
        assert_eq!(kv.put(1, "k".into(), "v2".into()), "v1");
        assert_eq!(kv.get("k"), "v2");
    }

    #[tokio::test]
    async fn clerk_round_trip_over_channel_transport() {
        let store = Arc::new(KvStore::new());
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        tokio::spawn(
            BaseChannel::with_defaults(server_transport).execute(KvService::new(store.clone()).serve()),
        );
        let clerk = Clerk::new(KvClient::new(client::Config::default(), client_transport).spawn());

        clerk.put("color", "blue").await;
        assert_eq!(clerk.get("color").await, "blue");
        assert_eq!(clerk.append("color", "ish").await, "blue");
        assert_eq!(clerk.get("color").await, "blueish");
        // Confirmed mutations leave no cached results behind.
        assert!(store.state.lock().unwrap().results.is_empty());
    }
}
