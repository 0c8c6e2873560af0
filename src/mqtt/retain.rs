use std::collections::{btree_map, BTreeMap};
use std::ops::Bound;

use bytes::Bytes;
use heronmq_protocol::QoS;

use crate::mqtt::trie::Filter;

/// The last message published with `retain=1` on each topic.
///
/// A retained PUBLISH with a non-empty payload replaces the previous message
/// for its topic; one with an empty payload clears it. New subscribers get
/// the retained message for every topic their filter matches.
#[derive(Default)]
pub struct RetainedMessages {
    by_topic: BTreeMap<String, RetainedMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetainedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

impl RetainedMessages {
    pub fn new() -> RetainedMessages {
        RetainedMessages::default()
    }

    pub fn len(&self) -> usize {
        self.by_topic.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_topic.is_empty()
    }

    /// Store or clear the retained message for `message.topic`.
    pub fn apply(&mut self, message: RetainedMessage) {
        if message.payload.is_empty() {
            self.by_topic.remove(&message.topic);
            return;
        }

        match self.by_topic.entry(message.topic.clone()) {
            btree_map::Entry::Occupied(mut occupied) => {
                occupied.insert(message);
            }
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(message);
            }
        }
    }

    /// Visit every retained message whose topic matches `filter`.
    pub fn visit_matches(&self, filter: &Filter, mut visit: impl FnMut(&RetainedMessage)) {
        let prefix = match filter.exact_or_prefix() {
            Ok(exact) => {
                // An exact filter matches at most one topic.
                if let Some(message) = self.by_topic.get(exact) {
                    visit(message);
                }

                return;
            }
            // The filter holds a wildcard; scan topics sharing its literal
            // prefix. The map is sorted, so everything with that prefix is
            // contiguous.
            Err(prefix) => prefix,
        };

        for (topic, message) in self
            .by_topic
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
        {
            if !topic.starts_with(prefix) {
                break;
            }

            if filter.matches_topic(topic) {
                visit(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, payload: &'static [u8], qos: QoS) -> RetainedMessage {
        RetainedMessage {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
            qos,
        }
    }

    fn matching_topics(retained: &RetainedMessages, filter: &str) -> Vec<String> {
        let filter: Filter = filter.parse().unwrap();
        let mut topics = Vec::new();
        retained.visit_matches(&filter, |m| topics.push(m.topic.clone()));
        topics.sort();
        topics
    }

    #[test]
    fn later_publish_replaces_earlier() {
        let mut retained = RetainedMessages::new();
        retained.apply(message("t", b"one", QoS::AtMostOnce));
        retained.apply(message("t", b"two", QoS::AtLeastOnce));

        assert_eq!(retained.len(), 1);
        retained.visit_matches(&"t".parse().unwrap(), |m| {
            assert_eq!(&m.payload[..], b"two");
            assert_eq!(m.qos, QoS::AtLeastOnce);
        });
    }

    #[test]
    fn empty_payload_clears() {
        let mut retained = RetainedMessages::new();
        retained.apply(message("t", b"data", QoS::AtMostOnce));
        retained.apply(message("t", b"", QoS::AtMostOnce));

        assert!(retained.is_empty());
        assert_eq!(matching_topics(&retained, "t"), Vec::<String>::new());
    }

    #[test]
    fn wildcard_filters_see_matching_topics_only() {
        let mut retained = RetainedMessages::new();
        retained.apply(message("sport/football", b"1", QoS::AtMostOnce));
        retained.apply(message("sport/tennis", b"2", QoS::AtMostOnce));
        retained.apply(message("news/politics", b"3", QoS::AtMostOnce));

        assert_eq!(
            matching_topics(&retained, "sport/#"),
            ["sport/football", "sport/tennis"]
        );
        assert_eq!(matching_topics(&retained, "+/tennis"), ["sport/tennis"]);
        assert_eq!(
            matching_topics(&retained, "#"),
            ["news/politics", "sport/football", "sport/tennis"]
        );
    }

    #[test]
    fn reserved_topics_hidden_from_leading_wildcards() {
        let mut retained = RetainedMessages::new();
        retained.apply(message("$SYS/broker", b"1", QoS::AtMostOnce));

        assert_eq!(matching_topics(&retained, "#"), Vec::<String>::new());
        assert_eq!(matching_topics(&retained, "$SYS/#"), ["$SYS/broker"]);
    }
}
