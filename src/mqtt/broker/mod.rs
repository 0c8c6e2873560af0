//! The TCP listener, the admission gate, and the state shared by every
//! connection task.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use color_eyre::eyre::WrapErr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::mqtt::connections::ConnectionManager;
use crate::mqtt::retain::RetainedMessages;
use crate::mqtt::session::{SessionStore, WillStore};
use crate::mqtt::trie::{Filter, SubscriptionTree, TreeUpdate};
use crate::mqtt::ConnectionId;
use crate::store::{self, DocumentStore, StoreError};

use connection::Connection;

mod connection;

/// Ceiling on concurrently served connections. Accepting blocks once reached.
pub const MAX_CONNECTIONS: usize = 10_000;

/// State shared across all connection tasks.
///
/// The subscription trie and retained messages sit behind readers-writer
/// locks (matching is the hot path); sessions, wills and the connection
/// registry do their own finer-grained locking.
pub struct Shared {
    pub sessions: SessionStore,
    pub wills: WillStore,
    pub tree: RwLock<SubscriptionTree>,
    pub retained: RwLock<RetainedMessages>,
    pub connections: ConnectionManager,
    pub store: Arc<dyn DocumentStore>,
    pub op_timeout: Duration,
    /// Cancelled once at shutdown; every connection task watches it.
    pub token: CancellationToken,
}

impl Shared {
    pub fn new(store: Arc<dyn DocumentStore>, op_timeout: Duration) -> Shared {
        Shared {
            sessions: SessionStore::new(Arc::clone(&store), op_timeout),
            wills: WillStore::new(Arc::clone(&store), op_timeout),
            tree: RwLock::new(SubscriptionTree::new()),
            retained: RwLock::new(RetainedMessages::new()),
            connections: ConnectionManager::new(),
            store,
            op_timeout,
            token: CancellationToken::new(),
        }
    }
}

/// Mirror a trie mutation into the `subscriptions` collection.
pub(crate) async fn persist_tree_update(
    shared: &Shared,
    update: TreeUpdate,
) -> Result<(), StoreError> {
    for document in update.upserts {
        let path = document.path.clone();
        let value = serde_json::to_value(document)?;

        store::with_timeout(
            shared.op_timeout,
            shared
                .store
                .upsert(store::SUBSCRIPTIONS, "path", &path, value),
        )
        .await?;
    }

    for path in update.removals {
        store::with_timeout(
            shared.op_timeout,
            shared.store.delete_one(store::SUBSCRIPTIONS, "path", &path),
        )
        .await?;
    }

    Ok(())
}

/// Drop every listed subscription of `client_id` from the trie, mirroring
/// the removals. Mirror failures are logged; the in-memory trie stays
/// authoritative.
pub(crate) async fn remove_subscriptions(
    shared: &Shared,
    client_id: &str,
    filters: impl IntoIterator<Item = String>,
) {
    for filter in filters {
        let Ok(parsed) = filter.parse::<Filter>() else {
            continue;
        };

        let (removed, update) = shared.tree.write().unwrap().delete(&parsed, client_id);

        if removed {
            if let Err(e) = persist_tree_update(shared, update).await {
                tracing::error!(client_id, %filter, "failed to mirror subscription removal: {e}");
            }
        }
    }
}

pub struct Broker {
    local_addr: SocketAddr,
    listener: TcpListener,
    shared: Arc<Shared>,
    gate: Arc<Semaphore>,
    tasks: JoinSet<()>,
    next_connection_id: ConnectionId,
}

impl Broker {
    pub async fn bind(listen_addr: SocketAddr, shared: Arc<Shared>) -> crate::Result<Broker> {
        let listener = TcpListener::bind(listen_addr)
            .await
            .wrap_err_with(|| format!("failed to bind listen_addr: {listen_addr}"))?;

        let local_addr = listener
            .local_addr()
            .wrap_err("failed to read bound listener address")?;

        Ok(Broker {
            local_addr,
            listener,
            shared,
            gate: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            tasks: JoinSet::new(),
            next_connection_id: 0,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(&mut self) -> crate::Result<()> {
        tracing::info!(listen_addr = %self.local_addr, "listening for connections");

        loop {
            // Hold one admission permit before accepting; at the ceiling this
            // is what blocks the accept loop.
            let permit = tokio::select! {
                _ = self.shared.token.cancelled() => break,
                permit = Arc::clone(&self.gate).acquire_owned() => {
                    permit.expect("admission gate is never closed")
                }
            };

            tokio::select! {
                _ = self.shared.token.cancelled() => break,
                Some(result) = self.tasks.join_next() => {
                    if let Err(e) = result {
                        tracing::error!(?e, "connection task panicked");
                    }
                }
                result = self.listener.accept() => self.handle_accept(result, permit),
            }
        }

        Ok(())
    }

    fn handle_accept(
        &mut self,
        result: std::io::Result<(TcpStream, SocketAddr)>,
        permit: OwnedSemaphorePermit,
    ) {
        match result {
            Ok((stream, remote_addr)) => {
                tracing::debug!(%remote_addr, "connection received");

                self.next_connection_id += 1;
                let conn = Connection::new(
                    self.next_connection_id,
                    stream,
                    remote_addr,
                    Arc::clone(&self.shared),
                );

                self.tasks.spawn(async move {
                    // The permit rides along with the task and frees a slot
                    // when the connection is fully torn down.
                    let _permit = permit;
                    conn.run().await;
                });
            }
            // TODO: some kinds of accept failures are probably fatal
            Err(e) => tracing::error!(?e, "accept failed"),
        }
    }

    pub fn connections(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting, signal every connection, and wait out the grace
    /// period before aborting stragglers.
    pub async fn shutdown(mut self, grace: Duration) -> crate::Result<()> {
        drop(self.listener);
        self.shared.token.cancel();

        let drain = async {
            while let Some(result) = self.tasks.join_next().await {
                if let Err(e) = result {
                    tracing::error!(?e, "connection task panicked during shutdown");
                }
            }
        };

        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(
                remaining = self.tasks.len(),
                "grace period expired; aborting remaining connection tasks"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        Ok(())
    }
}
