//! Session and will-message state, and the two-tier stores that hold them.
//!
//! Clean-session clients get a volatile session that lives only in the
//! in-memory tier. Persistent sessions are written through to the durable
//! document store and fronted by a bounded TTL cache on reads.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::mqtt::packet_id::PacketIdAllocator;
use crate::mqtt::ConnectionId;
use crate::store::{self, DocumentStore, StoreError, TtlCache};

/// Durable-read cache sizing: 256 entries, one hour apiece.
const CACHE_CAPACITY: usize = 256;
const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Everything the broker remembers about one client id.
///
/// The subscription map and the inflight bookkeeping survive restarts for
/// persistent sessions; the packet-id allocator is rebuilt per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub client_id: String,
    /// `true` iff the client connected with clean-session=1. Such sessions
    /// are never written to durable storage.
    pub temp_session: bool,
    /// Topic filter to granted QoS.
    pub subscriptions: HashMap<String, u8>,
    /// Outbound QoS 1 packet id to topic, awaiting PUBACK.
    pub pending_publish: HashMap<u16, String>,
    /// Inbound QoS 2 packet ids acknowledged with PUBREC, awaiting PUBREL.
    pub pending_pubrel: HashSet<u16>,
    /// Outbound QoS 2 packet id to topic, awaiting PUBREC.
    pub inflight_qos2: HashMap<u16, String>,
    /// Outbound QoS 2 packet ids whose PUBREL went out, awaiting PUBCOMP.
    pub awaiting_pubcomp: HashSet<u16>,
    #[serde(skip)]
    pub allocator: PacketIdAllocator,
}

impl Session {
    pub fn new(client_id: impl Into<String>, temp_session: bool) -> Session {
        Session {
            client_id: client_id.into(),
            temp_session,
            subscriptions: HashMap::new(),
            pending_publish: HashMap::new(),
            pending_pubrel: HashSet::new(),
            inflight_qos2: HashMap::new(),
            awaiting_pubcomp: HashSet::new(),
            allocator: PacketIdAllocator::new(),
        }
    }

    /// PUBACK received: the QoS 1 exchange for `pkid` is over.
    pub fn acknowledge_publish(&mut self, pkid: u16) -> bool {
        if self.pending_publish.remove(&pkid).is_some() {
            self.allocator.release(pkid);
            true
        } else {
            false
        }
    }

    /// PUBREC received: stop re-delivering, start waiting for PUBCOMP.
    pub fn acknowledge_receive(&mut self, pkid: u16) -> bool {
        if self.inflight_qos2.remove(&pkid).is_some() {
            self.awaiting_pubcomp.insert(pkid);
            true
        } else {
            false
        }
    }

    /// PUBCOMP received: the QoS 2 exchange for `pkid` is over.
    pub fn complete_publish(&mut self, pkid: u16) -> bool {
        if self.awaiting_pubcomp.remove(&pkid) {
            self.allocator.release(pkid);
            true
        } else {
            false
        }
    }
}

/// The two-tier session store.
///
/// `live` holds sessions with a connection attached (and all temporary
/// sessions); entries are shared with connection tasks and tagged with the
/// owning connection id, so a superseded connection tearing down late cannot
/// detach the session its successor just resumed. Persistent sessions
/// additionally live in the document store under the `sessions` collection.
pub struct SessionStore {
    live: DashMap<String, LiveSession>,
    cache: Mutex<TtlCache<Session>>,
    store: Arc<dyn DocumentStore>,
    op_timeout: Duration,
}

struct LiveSession {
    handle: Arc<Mutex<Session>>,
    owner: ConnectionId,
}

impl SessionStore {
    pub fn new(store: Arc<dyn DocumentStore>, op_timeout: Duration) -> SessionStore {
        SessionStore {
            live: DashMap::new(),
            cache: Mutex::new(TtlCache::new(CACHE_CAPACITY, CACHE_TTL)),
            store,
            op_timeout,
        }
    }

    /// The shared handle of a session currently attached to a connection.
    pub fn live(&self, client_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.live
            .get(client_id)
            .map(|entry| Arc::clone(&entry.handle))
    }

    /// Attach a session to the live tier on behalf of `owner`, returning the
    /// shared handle.
    pub fn insert_live(&self, session: Session, owner: ConnectionId) -> Arc<Mutex<Session>> {
        let handle = Arc::new(Mutex::new(session));
        let client_id = handle.lock().unwrap().client_id.clone();
        self.live.insert(
            client_id,
            LiveSession {
                handle: Arc::clone(&handle),
                owner,
            },
        );
        handle
    }

    /// Hand an already-live session to a new owning connection.
    pub fn adopt_live(&self, client_id: &str, handle: &Arc<Mutex<Session>>, owner: ConnectionId) {
        self.live.insert(
            client_id.to_owned(),
            LiveSession {
                handle: Arc::clone(handle),
                owner,
            },
        );
    }

    /// Detach a session from the live tier, but only if `owner` still owns
    /// it. Returns whether an entry was removed.
    pub fn remove_live(&self, client_id: &str, owner: ConnectionId) -> bool {
        self.live
            .remove_if(client_id, |_, live| live.owner == owner)
            .is_some()
    }

    /// Look up a persistent session in the cache or the durable tier.
    /// Does not consult or modify the live tier.
    pub async fn fetch(&self, client_id: &str) -> Result<Option<Session>, StoreError> {
        if let Some(session) = self.cache.lock().unwrap().get(client_id) {
            return Ok(Some(session));
        }

        let document = store::with_timeout(
            self.op_timeout,
            self.store.find_one_by(store::SESSIONS, "client_id", client_id),
        )
        .await?;

        let Some(document) = document else {
            return Ok(None);
        };

        let session: Session = serde_json::from_value(document)?;

        self.cache
            .lock()
            .unwrap()
            .insert(client_id.to_owned(), session.clone());

        Ok(Some(session))
    }

    /// Persist a session snapshot. Idempotent.
    ///
    /// Temporary sessions never reach the durable tier; saving one only
    /// invalidates any stale cache entry for the same client id.
    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        if session.temp_session {
            self.cache.lock().unwrap().remove(&session.client_id);
            return Ok(());
        }

        let document = serde_json::to_value(session)?;

        store::with_timeout(
            self.op_timeout,
            self.store
                .upsert(store::SESSIONS, "client_id", &session.client_id, document),
        )
        .await?;

        self.cache
            .lock()
            .unwrap()
            .insert(session.client_id.clone(), session.clone());

        Ok(())
    }

    /// Remove a session from every tier. Safe to call for unknown ids.
    pub async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        self.live.remove(client_id);
        self.cache.lock().unwrap().remove(client_id);

        store::with_timeout(
            self.op_timeout,
            self.store.delete_one(store::SESSIONS, "client_id", client_id),
        )
        .await?;

        Ok(())
    }
}

/// A will message declared at CONNECT time, published by the broker if the
/// connection dies without a DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WillMessage {
    pub client_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

/// Will records, keyed by client id, mirroring the session tiers: wills of
/// temporary sessions stay in memory, the rest go to `will_messages`.
pub struct WillStore {
    temp: DashMap<String, WillMessage>,
    store: Arc<dyn DocumentStore>,
    op_timeout: Duration,
}

impl WillStore {
    pub fn new(store: Arc<dyn DocumentStore>, op_timeout: Duration) -> WillStore {
        WillStore {
            temp: DashMap::new(),
            store,
            op_timeout,
        }
    }

    pub async fn get(&self, client_id: &str) -> Result<Option<WillMessage>, StoreError> {
        if let Some(will) = self.temp.get(client_id) {
            return Ok(Some(will.clone()));
        }

        let document = store::with_timeout(
            self.op_timeout,
            self.store
                .find_one_by(store::WILL_MESSAGES, "client_id", client_id),
        )
        .await?;

        document
            .map(|document| serde_json::from_value(document).map_err(StoreError::from))
            .transpose()
    }

    pub async fn save(&self, will: WillMessage, temp_session: bool) -> Result<(), StoreError> {
        if temp_session {
            self.temp.insert(will.client_id.clone(), will);
            return Ok(());
        }

        let document = serde_json::to_value(&will)?;

        store::with_timeout(
            self.op_timeout,
            self.store
                .upsert(store::WILL_MESSAGES, "client_id", &will.client_id, document),
        )
        .await
    }

    pub async fn delete(&self, client_id: &str) -> Result<(), StoreError> {
        self.temp.remove(client_id);

        store::with_timeout(
            self.op_timeout,
            self.store
                .delete_one(store::WILL_MESSAGES, "client_id", client_id),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn session_store() -> SessionStore {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store::initialize(&store).await.unwrap();
        SessionStore::new(store, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn persistent_sessions_round_trip_through_the_durable_tier() {
        let sessions = session_store().await;

        let mut session = Session::new("c1", false);
        session.subscriptions.insert("t".into(), 1);
        session.pending_publish.insert(3, "t".into());
        sessions.save(&session).await.unwrap();

        let fetched = sessions.fetch("c1").await.unwrap().expect("session saved");
        assert_eq!(fetched.client_id, "c1");
        assert_eq!(fetched.subscriptions.get("t"), Some(&1));
        assert_eq!(fetched.pending_publish.get(&3), Some(&"t".to_string()));
    }

    #[tokio::test]
    async fn temp_sessions_never_touch_durable_storage() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store::initialize(&store).await.unwrap();
        let sessions = SessionStore::new(Arc::clone(&store), Duration::from_secs(5));

        let session = Session::new("c1", true);
        sessions.save(&session).await.unwrap();

        assert_eq!(
            store
                .find_one_by(store::SESSIONS, "client_id", "c1")
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn fetch_serves_cached_reads() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store::initialize(&store).await.unwrap();
        let sessions = SessionStore::new(Arc::clone(&store), Duration::from_secs(5));

        sessions.save(&Session::new("c1", false)).await.unwrap();

        // Remove the document behind the store's back; the cache still serves it.
        store
            .delete_one(store::SESSIONS, "client_id", "c1")
            .await
            .unwrap();

        assert!(sessions.fetch("c1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_clears_every_tier() {
        let sessions = session_store().await;

        sessions.insert_live(Session::new("c1", true), 1);
        sessions.save(&Session::new("c1", false)).await.unwrap();

        sessions.delete("c1").await.unwrap();
        assert!(sessions.live("c1").is_none());
        assert!(sessions.fetch("c1").await.unwrap().is_none());

        // Deleting again is harmless.
        sessions.delete("c1").await.unwrap();
    }

    #[tokio::test]
    async fn remove_live_respects_ownership() {
        let sessions = session_store().await;

        let handle = sessions.insert_live(Session::new("c1", true), 1);

        // A successor adopts the session; the old owner can no longer detach it.
        sessions.adopt_live("c1", &handle, 2);
        assert!(!sessions.remove_live("c1", 1));
        assert!(sessions.live("c1").is_some());

        assert!(sessions.remove_live("c1", 2));
        assert!(sessions.live("c1").is_none());
    }

    #[tokio::test]
    async fn will_store_mirrors_session_tiers() {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        store::initialize(&store).await.unwrap();
        let wills = WillStore::new(Arc::clone(&store), Duration::from_secs(5));

        let will = WillMessage {
            client_id: "c1".into(),
            topic: "last".into(),
            payload: b"bye".to_vec(),
            qos: 0,
            retained: false,
        };

        wills.save(will.clone(), true).await.unwrap();
        assert_eq!(wills.get("c1").await.unwrap(), Some(will.clone()));
        assert_eq!(
            store
                .find_one_by(store::WILL_MESSAGES, "client_id", "c1")
                .await
                .unwrap(),
            None
        );

        wills.save(will.clone(), false).await.unwrap();
        assert!(store
            .find_one_by(store::WILL_MESSAGES, "client_id", "c1")
            .await
            .unwrap()
            .is_some());

        wills.delete("c1").await.unwrap();
        assert_eq!(wills.get("c1").await.unwrap(), None);
    }

    #[test]
    fn qos_bookkeeping_releases_ids() {
        let mut session = Session::new("c1", true);

        let pkid = session.allocator.next_id().unwrap();
        session.pending_publish.insert(pkid, "t".into());
        assert!(session.acknowledge_publish(pkid));
        assert!(!session.acknowledge_publish(pkid));
        assert_eq!(session.allocator.outstanding(), 0);

        let pkid = session.allocator.next_id().unwrap();
        session.inflight_qos2.insert(pkid, "t".into());
        assert!(session.acknowledge_receive(pkid));
        assert!(!session.acknowledge_receive(pkid));
        assert!(session.awaiting_pubcomp.contains(&pkid));
        assert!(session.complete_publish(pkid));
        assert!(!session.complete_publish(pkid));
        assert_eq!(session.allocator.outstanding(), 0);
    }
}
