//! Fan-out of PUBLISHes (and wills, and retained replays) to matching
//! subscribers, with the per-subscriber QoS downgrade and inflight
//! bookkeeping that QoS 1 and 2 delivery require.
//!
//! Routing is synchronous: the trie match runs under a read lock, per-session
//! state under that session's mutex, and delivery is a channel send into the
//! subscriber's connection task. No lock is held across either a socket
//! write or a durable-store call.

use std::cmp;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use heronmq_protocol::{Packet, Publish, QoS};

use crate::mqtt::broker::Shared;
use crate::mqtt::retain::RetainedMessage;
use crate::mqtt::session::{Session, WillMessage};
use crate::mqtt::trie::{valid_topic, Filter};

/// The acknowledgement owed to the publisher after routing.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishAck {
    /// QoS 0: nothing.
    None,
    PubAck(u16),
    PubRec(u16),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("publish topic is empty or contains wildcards")]
    InvalidTopic,
    #[error("QoS {0} PUBLISH with packet id 0")]
    ZeroPacketId(u8),
}

/// Route one inbound PUBLISH: retained handling, fan-out, publisher-side
/// inflight bookkeeping. Returns the ack the connection must send back.
pub fn route_publish(
    shared: &Shared,
    publish: &Publish,
    publisher: &Arc<Mutex<Session>>,
) -> Result<PublishAck, RouteError> {
    if !valid_topic(&publish.topic) {
        return Err(RouteError::InvalidTopic);
    }

    if publish.qos != QoS::AtMostOnce && publish.pkid == 0 {
        return Err(RouteError::ZeroPacketId(publish.qos as u8));
    }

    match publish.qos {
        QoS::AtMostOnce => {}
        QoS::AtLeastOnce => {
            let mut session = publisher.lock().unwrap();
            // Kept for replay; `or_insert_with` so an id the broker itself
            // allocated toward this client is never clobbered.
            session
                .pending_publish
                .entry(publish.pkid)
                .or_insert_with(|| publish.topic.clone());
        }
        QoS::ExactlyOnce => {
            let mut session = publisher.lock().unwrap();
            if !session.pending_pubrel.insert(publish.pkid) {
                // The exchange for this id already started (DUP redelivery):
                // acknowledge again but do not fan out a second time.
                return Ok(PublishAck::PubRec(publish.pkid));
            }
        }
    }

    if publish.retain {
        // Non-empty payload replaces the retained message, empty clears it;
        // either way the publish itself is still delivered normally.
        shared.retained.write().unwrap().apply(RetainedMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
            qos: publish.qos,
        });
    }

    fan_out(shared, &publish.topic, &publish.payload, publish.qos);

    Ok(match publish.qos {
        QoS::AtMostOnce => PublishAck::None,
        QoS::AtLeastOnce => PublishAck::PubAck(publish.pkid),
        QoS::ExactlyOnce => PublishAck::PubRec(publish.pkid),
    })
}

/// Publish a stored will message on abnormal disconnect. Same semantics as a
/// client PUBLISH with the stored qos and retain flag.
pub fn publish_will(shared: &Shared, will: &WillMessage) {
    let Ok(qos) = QoS::from_u8(will.qos) else {
        tracing::warn!(client_id = %will.client_id, qos = will.qos, "will message has invalid QoS; dropping");
        return;
    };

    if !valid_topic(&will.topic) {
        tracing::warn!(client_id = %will.client_id, topic = %will.topic, "will topic is invalid; dropping");
        return;
    }

    let payload = Bytes::from(will.payload.clone());

    if will.retained {
        shared.retained.write().unwrap().apply(RetainedMessage {
            topic: will.topic.clone(),
            payload: payload.clone(),
            qos,
        });
    }

    tracing::debug!(client_id = %will.client_id, topic = %will.topic, "publishing will message");
    fan_out(shared, &will.topic, &payload, qos);
}

/// Deliver matching subscribers their copy of a message.
///
/// Overlapping filters of one client coalesce into a single delivery at the
/// highest granted QoS [MQTT-3.3.5-1], then the publish QoS caps it.
fn fan_out(shared: &Shared, topic: &str, payload: &Bytes, publish_qos: QoS) {
    let subscriptions = shared.tree.read().unwrap().matches(topic);

    let mut per_client: HashMap<String, u8> = HashMap::new();
    for subscription in subscriptions {
        let granted = per_client.entry(subscription.client_id).or_insert(0);
        *granted = cmp::max(*granted, subscription.qos);
    }

    for (client_id, granted) in per_client {
        let granted = QoS::from_u8(granted).unwrap_or(QoS::AtMostOnce);
        let effective = cmp::min(publish_qos, granted);
        deliver(shared, &client_id, topic, payload, effective, false);
    }
}

/// Queue one PUBLISH onto a subscriber's connection. Disconnected
/// subscribers are skipped; there is no offline queueing.
fn deliver(
    shared: &Shared,
    client_id: &str,
    topic: &str,
    payload: &Bytes,
    effective: QoS,
    retain: bool,
) {
    let Some(sender) = shared.connections.sender(client_id) else {
        tracing::trace!(client_id, topic, "subscriber not connected; skipping");
        return;
    };

    let mut publish = Publish {
        dup: false,
        qos: effective,
        retain,
        topic: topic.to_owned(),
        pkid: 0,
        payload: payload.clone(),
    };

    if effective == QoS::AtMostOnce {
        let _ = sender.send(Packet::Publish(publish));
        return;
    }

    let Some(handle) = shared.sessions.live(client_id) else {
        tracing::trace!(client_id, topic, "subscriber has no live session; skipping");
        return;
    };

    let pkid = {
        let mut session = handle.lock().unwrap();
        let Some(pkid) = session.allocator.next_id() else {
            tracing::warn!(client_id, topic, "packet ids exhausted; dropping delivery");
            return;
        };

        match effective {
            QoS::AtMostOnce => unreachable!("handled above"),
            QoS::AtLeastOnce => session.pending_publish.insert(pkid, topic.to_owned()),
            QoS::ExactlyOnce => session.inflight_qos2.insert(pkid, topic.to_owned()),
        };

        pkid
    };

    publish.pkid = pkid;

    if sender.send(Packet::Publish(publish)).is_err() {
        // The connection went away under us; undo the bookkeeping.
        let mut session = handle.lock().unwrap();
        session.pending_publish.remove(&pkid);
        session.inflight_qos2.remove(&pkid);
        session.allocator.release(pkid);
    }
}

/// Build the retained-message replays owed to a fresh subscription.
///
/// Each matching retained message becomes a PUBLISH with the retain flag set
/// [MQTT-3.3.1-8], delivered at `min(granted, stored qos)` with inflight
/// bookkeeping against the subscriber's own session.
pub fn retained_publishes(
    shared: &Shared,
    session: &Arc<Mutex<Session>>,
    filter: &Filter,
    granted: QoS,
) -> Vec<Packet> {
    let mut packets = Vec::new();

    let retained = shared.retained.read().unwrap();
    retained.visit_matches(filter, |message| {
        let effective = cmp::min(message.qos, granted);

        let pkid = if effective == QoS::AtMostOnce {
            0
        } else {
            let mut session = session.lock().unwrap();
            let Some(pkid) = session.allocator.next_id() else {
                tracing::warn!(topic = %message.topic, "packet ids exhausted; dropping retained replay");
                return;
            };

            match effective {
                QoS::AtMostOnce => unreachable!("handled above"),
                QoS::AtLeastOnce => session.pending_publish.insert(pkid, message.topic.clone()),
                QoS::ExactlyOnce => session.inflight_qos2.insert(pkid, message.topic.clone()),
            };

            pkid
        };

        packets.push(Packet::Publish(Publish {
            dup: false,
            qos: effective,
            retain: true,
            topic: message.topic.clone(),
            pkid,
            payload: message.payload.clone(),
        }));
    });

    packets
}
