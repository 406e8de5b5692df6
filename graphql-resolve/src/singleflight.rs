//! De-duplicate identical upstream requests in flight.
//!
//! The first caller for a key becomes the leader and runs the load. Callers arriving
//! while it runs wait for its result instead of sending their own request. Entries are
//! removed as soon as the leader finishes, so results are shared, never cached.

use std::collections::HashMap;
use std::future::Future;
use std::hash::BuildHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::OwnedRwLockWriteGuard;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::Instrument;

use crate::error::ResolveError;

/// Number of samples after which a size hint starts over from its current average.
const SIZE_HINT_WINDOW: usize = 50;

type Slot = Arc<RwLock<Option<Result<Bytes, String>>>>;
type Shard = Mutex<HashMap<u64, Slot>>;

/// The result of a de-duplicated load.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Loaded {
    pub bytes: Bytes,
    /// The bytes were produced by another caller's request.
    pub shared: bool,
}

#[derive(Clone, Copy, Debug, Default)]
struct SizeHint {
    count: usize,
    total: usize,
}

pub struct SingleFlight {
    shards: Vec<Shard>,
    size_hints: Mutex<HashMap<u64, SizeHint>>,
    hasher: RandomState,
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new(4)
    }
}

enum Role {
    Leader(OwnedRwLockWriteGuard<Option<Result<Bytes, String>>>),
    Follower(Slot),
}

impl SingleFlight {
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::default()).collect(),
            size_hints: Mutex::default(),
            hasher: RandomState::new(),
        }
    }

    /// Identity of a request: the data source, the rendered input and any extra bytes
    /// the caller wants to discriminate on, such as forwarded headers.
    pub fn request_key(&self, data_source_id: &str, input: &[u8], extra: &[u8]) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        data_source_id.hash(&mut hasher);
        hasher.write(b":");
        hasher.write(input);
        hasher.write(extra);
        hasher.finish()
    }

    /// Identity of a fetch regardless of its input, used for size hints.
    pub fn fetch_key<'a>(&self, data_source_id: &str, root_fields: impl IntoIterator<Item = &'a str>) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        data_source_id.hash(&mut hasher);
        for field in root_fields {
            field.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Average response size seen for a fetch, zero when unknown.
    pub fn size_hint(&self, fetch_key: u64) -> usize {
        self.size_hints
            .lock()
            .get(&fetch_key)
            .filter(|hint| hint.count > 0)
            .map(|hint| hint.total / hint.count)
            .unwrap_or_default()
    }

    fn record_size(&self, fetch_key: u64, size: usize) {
        let mut hints = self.size_hints.lock();
        let hint = hints.entry(fetch_key).or_default();
        if hint.count >= SIZE_HINT_WINDOW {
            *hint = SizeHint {
                count: 1,
                total: hint.total / hint.count,
            };
        }
        hint.count += 1;
        hint.total += size;
    }

    fn shard(&self, key: u64) -> &Shard {
        &self.shards[(key % self.shards.len() as u64) as usize]
    }

    fn get_or_insert(&self, key: u64) -> Role {
        let mut shard = self.shard(key).lock();
        if let Some(slot) = shard.get(&key) {
            return Role::Follower(slot.clone());
        }
        let slot: Slot = Arc::new(RwLock::new(None));
        let Ok(guard) = slot.clone().try_write_owned() else {
            // nobody else can see the slot yet
            return Role::Follower(slot);
        };
        shard.insert(key, slot);
        Role::Leader(guard)
    }

    /// Runs `load` unless an identical request is already in flight, in which case
    /// its result is awaited. Waiting ends early with [`ResolveError::Cancelled`] when
    /// `cancellation` fires.
    pub async fn load<F, Fut>(
        &self,
        key: u64,
        fetch_key: u64,
        cancellation: &CancellationToken,
        load: F,
    ) -> Result<Loaded, BoxError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes, BoxError>>,
    {
        let mut load = Some(load);
        loop {
            match self.get_or_insert(key) {
                Role::Follower(slot) => {
                    let result = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => return Err(ResolveError::Cancelled.into()),
                        guard = slot.read().instrument(tracing::debug_span!("singleflight wait for leader")) => (*guard).clone(),
                    };
                    match result {
                        Some(Ok(bytes)) => return Ok(Loaded { bytes, shared: true }),
                        Some(Err(reason)) => return Err(reason.into()),
                        // the leader went away before finishing, try to lead
                        None => continue,
                    }
                }
                Role::Leader(mut guard) => {
                    let _removal = Removal {
                        shard: self.shard(key),
                        key,
                        slot: OwnedRwLockWriteGuard::rwlock(&guard).clone(),
                    };
                    let Some(load) = load.take() else {
                        failfast_error!("single flight leader elected twice");
                        return Err(ResolveError::Cancelled.into());
                    };
                    let result = tokio::select! {
                        biased;
                        _ = cancellation.cancelled() => return Err(ResolveError::Cancelled.into()),
                        result = load() => result,
                    };
                    if let Ok(bytes) = &result {
                        self.record_size(fetch_key, bytes.len());
                    }
                    *guard = Some(result.as_ref().map(Bytes::clone).map_err(|err| err.to_string()));
                    return result.map(|bytes| Loaded {
                        bytes,
                        shared: false,
                    });
                }
            }
        }
    }
}

/// Takes the leader's entry out of its shard, also when the leader is cancelled.
struct Removal<'a> {
    shard: &'a Shard,
    key: u64,
    slot: Slot,
}

impl Drop for Removal<'_> {
    fn drop(&mut self) {
        let mut shard = self.shard.lock();
        if shard
            .get(&self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &self.slot))
        {
            shard.remove(&self.key);
        }
    }
}
