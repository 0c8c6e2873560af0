use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use heronmq_protocol::{
    self as protocol, ConnAck, Connect, ConnectReturnCode, Packet, PubComp, PubRel, SubAck,
    Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::mqtt::broker::{self as broker, persist_tree_update, Shared};
use crate::mqtt::client_id::{self, ClientId};
use crate::mqtt::connections::ConnectionHandle;
use crate::mqtt::router::{self, PublishAck, RouteError};
use crate::mqtt::session::{Session, WillMessage};
use crate::mqtt::trie::{Filter, Subscription};
use crate::mqtt::{ConnectionId, KeepAlive};

/// How long a fresh connection gets to produce its CONNECT packet.
const CONNECT_DEADLINE: Duration = Duration::from_secs(60);

/// Largest accepted remaining length; the protocol maximum.
const MAX_PACKET_SIZE: usize = protocol::MAX_REMAINING_LENGTH;

pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,

    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,

    shared: Arc<Shared>,
    /// Child of the broker token; additionally cancelled when a newer
    /// connection takes this client id over.
    token: CancellationToken,

    client_id: Option<ClientId>,
    session: Option<Arc<Mutex<Session>>>,
    keep_alive: KeepAlive,
    /// Absolute deadline for the next inbound packet, when keep-alive is set.
    read_deadline: Option<Instant>,
    /// Set once the connection is registered, so teardown knows to deregister.
    registered: bool,
    /// Set when the client sent DISCONNECT; decides will handling.
    clean_disconnect: bool,
}

#[derive(Debug, thiserror::Error)]
enum ConnectionError {
    /// Malformed bytes or reserved flags; closed without any reply.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::Error),
    /// A well-formed packet the protocol forbids here.
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    #[error("no CONNECT within {CONNECT_DEADLINE:?}")]
    ConnectTimeout,
    #[error("keep-alive expired")]
    KeepAliveTimeout,
    #[error("error reading from socket: {0}")]
    Read(#[source] io::Error),
    #[error("error writing to socket: {0}")]
    Write(#[source] io::Error),
    /// CONNECT was answered with a failure code; the handshake is over.
    #[error("connect rejected: {0:?}")]
    Rejected(ConnectReturnCode),
}

enum Flow {
    Continue,
    Disconnect,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        stream: TcpStream,
        remote_addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Connection {
        let token = shared.token.child_token();

        Connection {
            id,
            remote_addr,
            stream,
            read_buf: BytesMut::with_capacity(8192),
            write_buf: BytesMut::with_capacity(8192),
            shared,
            token,
            client_id: None,
            session: None,
            keep_alive: KeepAlive::default(),
            read_deadline: None,
            registered: false,
            clean_disconnect: false,
        }
    }

    #[tracing::instrument(name = "Connection::run", skip_all, fields(remote_addr = %self.remote_addr))]
    pub async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            match e {
                ConnectionError::KeepAliveTimeout => {
                    tracing::debug!(keep_alive = self.keep_alive.as_seconds(), "{e}");
                }
                ConnectionError::Rejected(code) => {
                    tracing::debug!(?code, "connect rejected");
                }
                ConnectionError::Protocol(_) | ConnectionError::Violation(_) => {
                    tracing::debug!("closing connection: {e}");
                }
                ConnectionError::ConnectTimeout
                | ConnectionError::Read(_)
                | ConnectionError::Write(_) => {
                    tracing::debug!("connection error: {e}");
                }
            }
        }

        self.teardown().await;
    }

    async fn run_inner(&mut self) -> Result<(), ConnectionError> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();

        // AwaitingConnect: the first packet must arrive promptly and must be
        // a CONNECT. Most failures close the socket with no reply; the
        // protocol-mandated CONNACK failure codes are the exception.
        let first = match tokio::time::timeout(CONNECT_DEADLINE, self.recv()).await {
            Err(_) => return Err(ConnectionError::ConnectTimeout),
            Ok(Err(ConnectionError::Protocol(protocol::Error::InvalidProtocolLevel(level)))) => {
                tracing::debug!(level, "unacceptable protocol level");
                return self
                    .reject(ConnectReturnCode::UnacceptableProtocolVersion)
                    .await;
            }
            Ok(result) => result?,
        };

        let Some(packet) = first else {
            tracing::debug!("peer closed before CONNECT");
            return Ok(());
        };

        let Packet::Connect(connect) = packet else {
            return Err(ConnectionError::Violation("first packet must be CONNECT"));
        };

        self.handle_connect(connect, outbound_tx).await?;

        // Connected: dispatch packets until DISCONNECT, error, timeout,
        // shutdown or takeover.
        let token = self.token.clone();
        loop {
            tokio::select! {
                result = self.recv() => {
                    match result? {
                        Some(packet) => {
                            if let Flow::Disconnect = self.handle_packet(packet).await? {
                                break;
                            }
                        }
                        None => {
                            tracing::debug!("socket closed by peer");
                            break;
                        }
                    }
                }
                maybe_packet = outbound_rx.recv() => {
                    let Some(packet) = maybe_packet else { break };
                    self.send(&packet).await?;
                }
                _ = token.cancelled() => {
                    tracing::debug!("connection cancelled");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connect(
        &mut self,
        connect: Connect,
        outbound_tx: mpsc::UnboundedSender<Packet>,
    ) -> Result<(), ConnectionError> {
        let client_id: ClientId = match connect.client_id.parse() {
            Ok(client_id) => client_id,
            Err(e @ (client_id::ParseError::Empty | client_id::ParseError::TooLong(_))) => {
                tracing::debug!("rejecting client id: {e}");
                return self.reject(ConnectReturnCode::IdentifierRejected).await;
            }
        };

        // From here on teardown owns cleanup for this client id, even if the
        // handshake fails partway through.
        self.client_id = Some(client_id.clone());

        let shared = Arc::clone(&self.shared);

        let (session, session_present) = if connect.clean_session {
            // Discarding the previous session includes its subscriptions.
            let prior_filters: Vec<String> = match shared.sessions.live(&client_id) {
                Some(prior) => prior.lock().unwrap().subscriptions.keys().cloned().collect(),
                None => match shared.sessions.fetch(&client_id).await {
                    Ok(Some(prior)) => prior.subscriptions.into_keys().collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        tracing::error!(%client_id, "failed to load previous session: {e}");
                        return self.reject(ConnectReturnCode::ServerUnavailable).await;
                    }
                },
            };

            broker::remove_subscriptions(&shared, &client_id, prior_filters).await;

            if let Err(e) = shared.sessions.delete(&client_id).await {
                tracing::error!(%client_id, "failed to discard previous session: {e}");
                return self.reject(ConnectReturnCode::ServerUnavailable).await;
            }

            (
                shared
                    .sessions
                    .insert_live(Session::new(client_id.as_str(), true), self.id),
                false,
            )
        } else if let Some(existing) = shared.sessions.live(&client_id) {
            // Still attached to an older connection; the takeover below will
            // close that one. The session carries straight over to us.
            shared.sessions.adopt_live(&client_id, &existing, self.id);
            (existing, true)
        } else {
            match shared.sessions.fetch(&client_id).await {
                Ok(Some(session)) => (shared.sessions.insert_live(session, self.id), true),
                Ok(None) => {
                    let session = Session::new(client_id.as_str(), false);
                    if let Err(e) = shared.sessions.save(&session).await {
                        tracing::error!(%client_id, "failed to create session: {e}");
                        return self.reject(ConnectReturnCode::ServerUnavailable).await;
                    }
                    (shared.sessions.insert_live(session, self.id), false)
                }
                Err(e) => {
                    tracing::error!(%client_id, "failed to load session: {e}");
                    return self.reject(ConnectReturnCode::ServerUnavailable).await;
                }
            }
        };

        self.session = Some(Arc::clone(&session));

        let temp_session = session.lock().unwrap().temp_session;

        // The will declared on this CONNECT replaces whatever was stored
        // before; no will flag means no will for this connection.
        let will_result = match connect.last_will {
            Some(will) => {
                shared
                    .wills
                    .save(
                        WillMessage {
                            client_id: client_id.to_string(),
                            topic: will.topic,
                            payload: will.message.to_vec(),
                            qos: will.qos as u8,
                            retained: will.retain,
                        },
                        temp_session,
                    )
                    .await
            }
            None => shared.wills.delete(&client_id).await,
        };

        if let Err(e) = will_result {
            tracing::error!(%client_id, "failed to store will message: {e}");
            return self.reject(ConnectReturnCode::ServerUnavailable).await;
        }

        // Resumed sessions bring their subscriptions back into the trie.
        if session_present {
            let subscriptions: Vec<(String, u8)> = {
                let session = session.lock().unwrap();
                session
                    .subscriptions
                    .iter()
                    .map(|(filter, &qos)| (filter.clone(), qos))
                    .collect()
            };

            for (filter, qos) in subscriptions {
                let Ok(parsed) = filter.parse::<Filter>() else {
                    tracing::warn!(%client_id, %filter, "stored subscription no longer parses; dropping");
                    continue;
                };

                let update = shared.tree.write().unwrap().insert(
                    &parsed,
                    Subscription {
                        client_id: client_id.to_string(),
                        topic_filter: filter.clone(),
                        qos,
                    },
                );

                if let Err(e) = persist_tree_update(&shared, update).await {
                    tracing::error!(%client_id, %filter, "failed to mirror resumed subscription: {e}");
                }
            }
        }

        // Register; a previous connection for this client id loses.
        let replaced = shared.connections.register(
            &client_id,
            ConnectionHandle {
                id: self.id,
                sender: outbound_tx,
                token: self.token.clone(),
            },
        );

        if let Some(old) = replaced {
            tracing::info!(%client_id, old_connection = old.id, "client id taken over; closing previous connection");
            old.token.cancel();
        }

        self.registered = true;
        self.keep_alive = KeepAlive::from_seconds(connect.keep_alive);
        self.bump_read_deadline();

        tracing::info!(%client_id, keep_alive = connect.keep_alive, clean_session = connect.clean_session, "client connected");

        self.send(&Packet::ConnAck(ConnAck {
            session_present,
            code: ConnectReturnCode::Accepted,
        }))
        .await?;

        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<Flow, ConnectionError> {
        match packet {
            // MQTT-3.1.0-2
            Packet::Connect(_) => {
                return Err(ConnectionError::Violation("second CONNECT packet"));
            }
            Packet::Publish(publish) => {
                let session = self.session().clone();

                match router::route_publish(&self.shared, &publish, &session) {
                    Ok(PublishAck::None) => {}
                    Ok(PublishAck::PubAck(pkid)) => {
                        self.send(&Packet::PubAck(protocol::PubAck { pkid })).await?;
                    }
                    Ok(PublishAck::PubRec(pkid)) => {
                        self.send(&Packet::PubRec(protocol::PubRec { pkid })).await?;
                    }
                    Err(e @ (RouteError::InvalidTopic | RouteError::ZeroPacketId(_))) => {
                        tracing::debug!("rejecting publish: {e}");
                        return Err(ConnectionError::Violation("invalid PUBLISH"));
                    }
                }
            }
            Packet::PubAck(puback) => {
                if !self.session().lock().unwrap().acknowledge_publish(puback.pkid) {
                    tracing::trace!(pkid = puback.pkid, "PUBACK for unknown packet id");
                }
            }
            Packet::PubRec(pubrec) => {
                if !self.session().lock().unwrap().acknowledge_receive(pubrec.pkid) {
                    tracing::trace!(pkid = pubrec.pkid, "PUBREC for unknown packet id");
                }

                // Reply even for a duplicate PUBREC: our earlier PUBREL may
                // have been lost.
                self.send(&Packet::PubRel(PubRel { pkid: pubrec.pkid })).await?;
            }
            Packet::PubRel(pubrel) => {
                if !self
                    .session()
                    .lock()
                    .unwrap()
                    .pending_pubrel
                    .remove(&pubrel.pkid)
                {
                    tracing::trace!(pkid = pubrel.pkid, "PUBREL for unknown packet id");
                }

                self.send(&Packet::PubComp(PubComp { pkid: pubrel.pkid })).await?;
            }
            Packet::PubComp(pubcomp) => {
                if !self.session().lock().unwrap().complete_publish(pubcomp.pkid) {
                    tracing::trace!(pkid = pubcomp.pkid, "PUBCOMP for unknown packet id");
                }
            }
            Packet::Subscribe(subscribe) => return self.handle_subscribe(subscribe).await,
            Packet::Unsubscribe(unsubscribe) => {
                return self.handle_unsubscribe(unsubscribe).await;
            }
            Packet::PingReq => {
                self.send(&Packet::PingResp).await?;
            }
            Packet::Disconnect => {
                tracing::debug!("client disconnected cleanly");
                self.clean_disconnect = true;
                return Ok(Flow::Disconnect);
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Err(ConnectionError::Violation(
                    "client sent a server-to-client packet",
                ));
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_subscribe(&mut self, subscribe: Subscribe) -> Result<Flow, ConnectionError> {
        let session = self.session().clone();
        let client_id = self.client_id().to_string();

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut granted = Vec::new();

        for filter in subscribe.filters {
            let parsed = match filter.path.parse::<Filter>() {
                Ok(parsed) => parsed,
                Err(e) => {
                    tracing::debug!(filter = %filter.path, "rejecting filter: {e}");
                    return_codes.push(SubscribeReturnCode::Failure);
                    continue;
                }
            };

            // Granted QoS is the requested QoS; the broker supports up to 2.
            let qos = filter.qos;
            let previous = session
                .lock()
                .unwrap()
                .subscriptions
                .get(filter.path.as_str())
                .copied();

            let update = self.shared.tree.write().unwrap().insert(
                &parsed,
                Subscription {
                    client_id: client_id.clone(),
                    topic_filter: filter.path.clone(),
                    qos: qos as u8,
                },
            );

            if let Err(e) = persist_tree_update(&self.shared, update).await {
                tracing::error!(filter = %filter.path, "failed to mirror subscription: {e}");

                // Put the trie back the way it was before reporting failure.
                let mut tree = self.shared.tree.write().unwrap();
                match previous {
                    Some(old_qos) => {
                        tree.insert(
                            &parsed,
                            Subscription {
                                client_id: client_id.clone(),
                                topic_filter: filter.path.clone(),
                                qos: old_qos,
                            },
                        );
                    }
                    None => {
                        tree.delete(&parsed, &client_id);
                    }
                }

                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            session
                .lock()
                .unwrap()
                .subscriptions
                .insert(filter.path.clone(), qos as u8);

            return_codes.push(SubscribeReturnCode::Success(qos));
            granted.push((parsed, qos));
        }

        self.send(&Packet::SubAck(SubAck {
            pkid: subscribe.pkid,
            return_codes,
        }))
        .await?;

        // Retained messages replay to the new filters right after the SUBACK.
        for (filter, qos) in granted {
            let replays = router::retained_publishes(&self.shared, &session, &filter, qos);
            for packet in replays {
                self.send(&packet).await?;
            }
        }

        Ok(Flow::Continue)
    }

    async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<Flow, ConnectionError> {
        let session = self.session().clone();
        let client_id = self.client_id().to_string();

        for path in unsubscribe.filters {
            if let Ok(filter) = path.parse::<Filter>() {
                let (removed, update) =
                    self.shared.tree.write().unwrap().delete(&filter, &client_id);

                if removed {
                    if let Err(e) = persist_tree_update(&self.shared, update).await {
                        tracing::error!(filter = %path, "failed to mirror unsubscribe: {e}");
                    }
                }
            }

            session.lock().unwrap().subscriptions.remove(&path);
        }

        self.send(&Packet::UnsubAck(UnsubAck {
            pkid: unsubscribe.pkid,
        }))
        .await?;

        Ok(Flow::Continue)
    }

    /// Every exit path funnels through here: deregister, fire or drop the
    /// will, and persist or delete the session.
    async fn teardown(&mut self) {
        let Some(client_id) = self.client_id.take() else {
            // Never completed a CONNECT; nothing to clean up.
            return;
        };

        let taken_over = self.registered && !self.owns_registration(&client_id);
        if self.registered {
            self.shared.connections.remove(&client_id, self.id);
        }

        if taken_over {
            // A newer connection owns this client id; its CONNECT already
            // took responsibility for the session and will state.
            tracing::debug!(%client_id, "tearing down superseded connection");
            return;
        }

        // Will handling only applies once the CONNECT was fully accepted; a
        // failed handshake must not fire a will stored by an earlier session.
        if self.registered {
            if self.clean_disconnect {
                if let Err(e) = self.shared.wills.delete(&client_id).await {
                    tracing::error!(%client_id, "failed to drop will message: {e}");
                }
            } else {
                match self.shared.wills.get(&client_id).await {
                    Ok(Some(will)) => {
                        router::publish_will(&self.shared, &will);
                        if let Err(e) = self.shared.wills.delete(&client_id).await {
                            tracing::error!(%client_id, "failed to remove published will: {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => tracing::error!(%client_id, "failed to load will message: {e}"),
                }
            }
        }

        if let Some(session) = self.session.take() {
            let snapshot = session.lock().unwrap().clone();

            if snapshot.temp_session {
                // Volatile session: it lives only in the live tier, and its
                // subscriptions die with it. If a successor adopted the
                // session in the meantime, both are its problem now.
                if self.shared.sessions.remove_live(&client_id, self.id) {
                    broker::remove_subscriptions(
                        &self.shared,
                        &client_id,
                        snapshot.subscriptions.into_keys(),
                    )
                    .await;
                }
            } else {
                if let Err(e) = self.shared.sessions.save(&snapshot).await {
                    tracing::error!(%client_id, "failed to persist session: {e}");
                }
                self.shared.sessions.remove_live(&client_id, self.id);
            }
        }

        tracing::info!(%client_id, "connection closed");
    }

    fn owns_registration(&self, client_id: &str) -> bool {
        self.shared
            .connections
            .owner(client_id)
            .is_some_and(|owner| owner == self.id)
    }

    /// Read one packet off the socket, honoring the keep-alive deadline.
    ///
    /// `Ok(None)` means the peer closed the stream.
    async fn recv(&mut self) -> Result<Option<Packet>, ConnectionError> {
        loop {
            match protocol::read_mut(&mut self.read_buf, MAX_PACKET_SIZE) {
                Ok(packet) => {
                    tracing::trace!(?packet, "received");
                    self.bump_read_deadline();
                    return Ok(Some(packet));
                }
                Err(protocol::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }

            let read = match self.read_deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.stream.read_buf(&mut self.read_buf))
                        .await
                    {
                        Ok(result) => result.map_err(ConnectionError::Read)?,
                        Err(_) => return Err(ConnectionError::KeepAliveTimeout),
                    }
                }
                None => self
                    .stream
                    .read_buf(&mut self.read_buf)
                    .await
                    .map_err(ConnectionError::Read)?,
            };

            if read == 0 {
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        tracing::trace!(?packet, "sending");

        protocol::write(packet, &mut self.write_buf)?;

        self.stream
            .write_all_buf(&mut self.write_buf)
            .await
            .map_err(ConnectionError::Write)?;

        Ok(())
    }

    /// Send a failing CONNACK and end the handshake.
    async fn reject(&mut self, code: ConnectReturnCode) -> Result<(), ConnectionError> {
        self.send(&Packet::ConnAck(ConnAck {
            session_present: false,
            code,
        }))
        .await?;

        let _ = self.stream.shutdown().await;

        Err(ConnectionError::Rejected(code))
    }

    /// The next packet must arrive within 1.5x the keep-alive interval.
    fn bump_read_deadline(&mut self) {
        self.read_deadline = self
            .keep_alive
            .as_timeout()
            .map(|timeout| Instant::now() + timeout);
    }

    fn session(&self) -> &Arc<Mutex<Session>> {
        self.session.as_ref().expect("session set after CONNECT")
    }

    fn client_id(&self) -> &ClientId {
        self.client_id.as_ref().expect("client id set after CONNECT")
    }
}
