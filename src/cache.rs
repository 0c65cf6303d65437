//! # Opportunistic Content Cache
//!
//! When a cacheable request for content `K` traverses this node and the
//! matching response later flows back through it, the payload is kept so
//! the next request for `K` can be answered here instead of continuing
//! toward the group holding it.
//!
//! Content keys are `blake3(payload)`; a cacheable request carries the
//! 32-byte key it wants as its payload. Storage is an LRU index under a
//! byte budget. The caller may plug in an external store through the cache
//! functors supplied at join; the in-memory index is always consulted
//! first.

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::id::NodeId;
use crate::message::{Message, MessageKind};

/// 32-byte content address: `blake3` of the payload.
pub type ContentKey = [u8; 32];

pub type StoreCacheDataFn = Box<dyn Fn(ContentKey, &[u8]) + Send + Sync>;
pub type HaveCacheDataFn = Box<dyn Fn(&ContentKey) -> Option<Vec<u8>> + Send + Sync>;

struct CacheState {
    entries: LruCache<ContentKey, Vec<u8>>,
    total_bytes: usize,
}

pub struct CacheManager {
    own_id: NodeId,
    max_bytes: usize,
    state: Mutex<CacheState>,
    store_functor: RwLock<Option<StoreCacheDataFn>>,
    have_functor: RwLock<Option<HaveCacheDataFn>>,
}

impl CacheManager {
    pub fn new(own_id: NodeId, max_bytes: usize) -> Self {
        Self {
            own_id,
            max_bytes,
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            store_functor: RwLock::new(None),
            have_functor: RwLock::new(None),
        }
    }

    /// Install the caller's external cache hooks.
    pub fn initialise_functors(
        &self,
        store: Option<StoreCacheDataFn>,
        have: Option<HaveCacheDataFn>,
    ) {
        *self.store_functor.write() = store;
        *self.have_functor.write() = have;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.state.lock().total_bytes
    }

    /// Record the payload of a cacheable response passing through.
    pub fn add_to_cache(&self, msg: &Message) {
        if !msg.is_response() || !msg.cacheable || msg.kind != MessageKind::Data {
            return;
        }
        if msg.payload.is_empty() || msg.payload.len() > self.max_bytes {
            return;
        }
        let key: ContentKey = *blake3::hash(&msg.payload).as_bytes();

        {
            let mut state = self.state.lock();
            if state.entries.contains(&key) {
                state.entries.promote(&key);
            } else {
                state.total_bytes += msg.payload.len();
                state.entries.put(key, msg.payload.clone());
                trace!(
                    key = %hex::encode(&key[..8]),
                    bytes = msg.payload.len(),
                    total = state.total_bytes,
                    "payload cached"
                );
                while state.total_bytes > self.max_bytes {
                    match state.entries.pop_lru() {
                        Some((evicted_key, evicted)) => {
                            state.total_bytes -= evicted.len();
                            debug!(
                                key = %hex::encode(&evicted_key[..8]),
                                bytes = evicted.len(),
                                "cache entry evicted"
                            );
                        }
                        None => break,
                    }
                }
            }
        }

        if let Some(store) = self.store_functor.read().as_ref() {
            store(key, &msg.payload);
        }
    }

    /// Try to answer a cacheable request locally.
    ///
    /// On a hit the message is rewritten in place into the response the
    /// content's holder would have produced, and `true` tells the
    /// forwarder to route that response instead of relaying the request.
    pub fn handle_get_from_cache(&self, msg: &mut Message) -> bool {
        if !msg.is_request() || !msg.cacheable || msg.kind != MessageKind::Data {
            return false;
        }
        let key: ContentKey = match msg.payload.as_slice().try_into() {
            Ok(key) => key,
            Err(_) => return false,
        };

        let cached = {
            let mut state = self.state.lock();
            state.entries.get(&key).cloned()
        };
        let cached = cached.or_else(|| {
            self.have_functor
                .read()
                .as_ref()
                .and_then(|have| have(&key))
        });

        match cached {
            Some(payload) => {
                debug!(key = %hex::encode(&key[..8]), "request answered from cache");
                *msg = msg.to_response(self.own_id, payload);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Direction;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn cached_response(payload: &[u8]) -> Message {
        let mut msg = Message::request(MessageKind::Data, NodeId::random(), NodeId::random())
            .with_payload(payload.to_vec())
            .with_cacheable(true);
        msg.direction = Direction::Response;
        msg
    }

    fn get_request(payload: &[u8]) -> Message {
        let key: ContentKey = *blake3::hash(payload).as_bytes();
        Message::request(MessageKind::Data, NodeId::random(), NodeId::random())
            .with_payload(key.to_vec())
            .with_cacheable(true)
            .with_response_id(17)
    }

    #[test]
    fn round_trip_and_rewrite() {
        let own = NodeId::random();
        let cache = CacheManager::new(own, 1024);
        cache.add_to_cache(&cached_response(b"the content"));

        let mut request = get_request(b"the content");
        let requester = request.source;
        assert!(cache.handle_get_from_cache(&mut request));
        assert!(request.is_response());
        assert_eq!(request.payload, b"the content");
        assert_eq!(request.source, own);
        assert_eq!(request.destination, requester);
        assert_eq!(request.response_id, Some(17));
    }

    #[test]
    fn miss_leaves_request_untouched() {
        let cache = CacheManager::new(NodeId::random(), 1024);
        let mut request = get_request(b"never stored");
        assert!(!cache.handle_get_from_cache(&mut request));
        assert!(request.is_request());
    }

    #[test]
    fn non_cacheable_traffic_ignored() {
        let cache = CacheManager::new(NodeId::random(), 1024);

        let mut plain = cached_response(b"data");
        plain.cacheable = false;
        cache.add_to_cache(&plain);
        assert_eq!(cache.len(), 0);

        // Requests are never stored, responses are never answered.
        let request = get_request(b"data").with_cacheable(true);
        cache.add_to_cache(&request);
        assert_eq!(cache.len(), 0);

        let mut response = cached_response(b"data");
        assert!(!cache.handle_get_from_cache(&mut response));
    }

    #[test]
    fn malformed_key_is_a_miss() {
        let cache = CacheManager::new(NodeId::random(), 1024);
        cache.add_to_cache(&cached_response(b"content"));
        let mut request = get_request(b"content");
        request.payload = b"short".to_vec();
        assert!(!cache.handle_get_from_cache(&mut request));
    }

    #[test]
    fn lru_eviction_under_byte_budget() {
        let cache = CacheManager::new(NodeId::random(), 64);
        cache.add_to_cache(&cached_response(&[1u8; 30]));
        cache.add_to_cache(&cached_response(&[2u8; 30]));
        assert_eq!(cache.len(), 2);

        // Touch the first entry so the second becomes the eviction victim.
        let mut touch = get_request(&[1u8; 30]);
        assert!(cache.handle_get_from_cache(&mut touch));

        cache.add_to_cache(&cached_response(&[3u8; 30]));
        assert!(cache.total_bytes() <= 64);

        let mut oldest = get_request(&[2u8; 30]);
        assert!(!cache.handle_get_from_cache(&mut oldest));
        let mut kept = get_request(&[1u8; 30]);
        assert!(cache.handle_get_from_cache(&mut kept));
    }

    #[test]
    fn external_functors_participate() {
        let cache = CacheManager::new(NodeId::random(), 1024);
        let stored = Arc::new(AtomicUsize::new(0));
        let stored2 = stored.clone();
        let side_payload = b"held externally".to_vec();
        let side_key: ContentKey = *blake3::hash(&side_payload).as_bytes();
        let side = side_payload.clone();

        cache.initialise_functors(
            Some(Box::new(move |_key, _bytes| {
                stored2.fetch_add(1, Ordering::SeqCst);
            })),
            Some(Box::new(move |key| {
                (key == &side_key).then(|| side.clone())
            })),
        );

        cache.add_to_cache(&cached_response(b"content"));
        assert_eq!(stored.load(Ordering::SeqCst), 1);

        // A key only the external store knows still hits.
        let mut request = get_request(&side_payload);
        assert!(cache.handle_get_from_cache(&mut request));
        assert_eq!(request.payload, side_payload);
    }
}
