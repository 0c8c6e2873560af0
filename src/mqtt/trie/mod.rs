//! The subscription trie: topic filters laid out level by level, with `+`
//! held in a dedicated child slot and `#` subscribers attached to the node
//! the wildcard hangs off.
//!
//! Mutations return the set of changed nodes as path-keyed documents so the
//! caller can mirror them into the `subscriptions` collection without the
//! trie knowing anything about storage. The in-memory trie stays
//! authoritative; the mirror is write-through.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use slotmap::SlotMap;

mod filter;

pub use filter::{valid_topic, Filter, FilterParseError};

slotmap::new_key_type! {
    /// Stable identity of a trie node for the lifetime of the process.
    pub struct NodeId;
}

/// One subscriber of one topic filter. A client appears at most once per
/// filter; re-subscription replaces the granted QoS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub client_id: String,
    pub topic_filter: String,
    /// Granted QoS, 0..=2.
    pub qos: u8,
}

struct Node {
    /// Level names from the root joined by `/`; uniquely identifies a node.
    path: String,
    /// The trailing token of `path`.
    level: String,
    parent: Option<NodeId>,
    /// Exact-match children. Keys never contain `/`, `+` or `#`.
    children: HashMap<String, NodeId>,
    /// The `+` slot at this level.
    wildcard_plus: Option<NodeId>,
    /// Subscriptions whose filter ends in `#` directly below this node.
    wildcard_hash: Vec<Subscription>,
    /// Subscriptions whose filter ends exactly at this node.
    terminals: Vec<Subscription>,
}

impl Node {
    fn new(path: String, level: String, parent: NodeId) -> Node {
        Node {
            path,
            level,
            parent: Some(parent),
            children: HashMap::new(),
            wildcard_plus: None,
            wildcard_hash: Vec::new(),
            terminals: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.children.is_empty()
            && self.wildcard_plus.is_none()
            && self.wildcard_hash.is_empty()
            && self.terminals.is_empty()
    }
}

/// A trie node flattened for the durable `subscriptions` collection.
///
/// The root holds only the bare-`#` subscriber list and is mirrored under the
/// reserved path `"#"`, which no materialized node path can collide with
/// since `#` never appears inside a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub path: String,
    pub level: String,
    /// Child level name to child path.
    pub children: BTreeMap<String, String>,
    pub wildcard_plus: Option<String>,
    pub wildcard_hash: Vec<Subscription>,
    pub terminals: Vec<Subscription>,
}

/// The durable-mirror delta produced by one mutation.
#[derive(Debug, Default)]
pub struct TreeUpdate {
    pub upserts: Vec<NodeDocument>,
    pub removals: Vec<String>,
}

pub struct SubscriptionTree {
    nodes: SlotMap<NodeId, Node>,
    root: NodeId,
}

impl Default for SubscriptionTree {
    fn default() -> Self {
        let mut nodes: SlotMap<NodeId, Node> = SlotMap::with_key();
        let root = nodes.insert(Node {
            path: String::new(),
            level: String::new(),
            parent: None,
            children: HashMap::new(),
            wildcard_plus: None,
            wildcard_hash: Vec::new(),
            terminals: Vec::new(),
        });

        SubscriptionTree { nodes, root }
    }
}

impl SubscriptionTree {
    pub fn new() -> SubscriptionTree {
        SubscriptionTree::default()
    }

    /// Add (or refresh) a subscription under `filter`.
    pub fn insert(&mut self, filter: &Filter, subscription: Subscription) -> TreeUpdate {
        let mut dirty = HashSet::new();
        let mut current = self.root;

        for level in filter.levels() {
            if level == "#" {
                // Validated to be the final level; the subscribers hang off
                // the node the wildcard is below.
                upsert_subscription(&mut self.nodes[current].wildcard_hash, &subscription);
                dirty.insert(current);
                return self.update_for(dirty, Vec::new());
            }

            let next = if level == "+" {
                match self.nodes[current].wildcard_plus {
                    Some(id) => id,
                    None => {
                        let id = self.create_child(current, level);
                        self.nodes[current].wildcard_plus = Some(id);
                        dirty.insert(current);
                        dirty.insert(id);
                        id
                    }
                }
            } else {
                match self.nodes[current].children.get(level) {
                    Some(&id) => id,
                    None => {
                        let id = self.create_child(current, level);
                        self.nodes[current].children.insert(level.to_owned(), id);
                        dirty.insert(current);
                        dirty.insert(id);
                        id
                    }
                }
            };

            current = next;
        }

        upsert_subscription(&mut self.nodes[current].terminals, &subscription);
        dirty.insert(current);

        self.update_for(dirty, Vec::new())
    }

    /// Remove `client_id`'s subscription to `filter`.
    ///
    /// Returns whether anything was removed, plus the mirror delta. Nodes
    /// left with no children and no subscribers are pruned back toward the
    /// root.
    pub fn delete(&mut self, filter: &Filter, client_id: &str) -> (bool, TreeUpdate) {
        let Some(node_id) = self.locate(filter) else {
            return (false, TreeUpdate::default());
        };

        let node = &mut self.nodes[node_id];
        let list = if filter.is_multi_level() {
            &mut node.wildcard_hash
        } else {
            &mut node.terminals
        };

        let before = list.len();
        list.retain(|sub| {
            !(sub.client_id == client_id && sub.topic_filter == filter.as_str())
        });
        let removed = list.len() != before;

        if !removed {
            return (false, TreeUpdate::default());
        }

        let mut dirty = HashSet::new();
        dirty.insert(node_id);

        let removals = self.prune(node_id, &mut dirty);

        (true, self.update_for(dirty, removals))
    }

    /// All subscriptions matching a concrete publish topic.
    ///
    /// The caller guarantees `topic` is a valid publish topic (non-empty and
    /// wildcard-free). Results are deduplicated by `(client_id, filter)`.
    pub fn matches(&self, topic: &str) -> Vec<Subscription> {
        debug_assert!(valid_topic(topic), "invalid publish topic: {topic:?}");

        let levels: Vec<&str> = topic.split('/').collect();
        let first = levels[0];
        // Wildcards at the first level never match a leading `$` [MQTT-4.7.2-1].
        let reserved = first.starts_with('$');

        let mut results: Vec<Subscription> = Vec::new();
        let root = &self.nodes[self.root];

        if !reserved {
            results.extend_from_slice(&root.wildcard_hash);
        }

        let mut queue: Vec<NodeId> = Vec::new();
        if let Some(&child) = root.children.get(first) {
            queue.push(child);
        }
        if !reserved {
            if let Some(plus) = root.wildcard_plus {
                queue.push(plus);
            }
        }

        for level in &levels[1..] {
            let mut next_queue = Vec::new();

            for &node_id in &queue {
                let node = &self.nodes[node_id];

                // `#` below this node matches any deeper topic.
                results.extend_from_slice(&node.wildcard_hash);

                if let Some(&child) = node.children.get(*level) {
                    next_queue.push(child);
                }
                if let Some(plus) = node.wildcard_plus {
                    next_queue.push(plus);
                }
            }

            queue = next_queue;
            if queue.is_empty() {
                break;
            }
        }

        for &node_id in &queue {
            let node = &self.nodes[node_id];
            results.extend_from_slice(&node.terminals);
            // `a/#` also matches `a` itself.
            results.extend_from_slice(&node.wildcard_hash);
        }

        let mut seen = HashSet::new();
        results.retain(|sub| seen.insert((sub.client_id.clone(), sub.topic_filter.clone())));

        results
    }

    /// Number of nodes, the root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn create_child(&mut self, parent: NodeId, level: &str) -> NodeId {
        let parent_node = &self.nodes[parent];
        let path = if parent == self.root {
            level.to_owned()
        } else {
            format!("{}/{}", parent_node.path, level)
        };

        self.nodes.insert(Node::new(path, level.to_owned(), parent))
    }

    /// Walk to the node a filter's subscriptions live on: the final level's
    /// node, or for a `#` filter the node above the wildcard.
    fn locate(&self, filter: &Filter) -> Option<NodeId> {
        let mut current = self.root;

        for level in filter.levels() {
            if level == "#" {
                break;
            }

            let node = &self.nodes[current];
            current = if level == "+" {
                node.wildcard_plus?
            } else {
                *node.children.get(level)?
            };
        }

        Some(current)
    }

    /// Starting at `node_id`, remove empty nodes up toward the root.
    /// Returns the paths of removed nodes; parents they detached from are
    /// added to `dirty`.
    fn prune(&mut self, mut node_id: NodeId, dirty: &mut HashSet<NodeId>) -> Vec<String> {
        let mut removals = Vec::new();

        while node_id != self.root && self.nodes[node_id].is_empty() {
            let parent = self.nodes[node_id].parent.expect("non-root node has a parent");

            let node = self.nodes.remove(node_id).expect("node present while pruning");
            removals.push(node.path);

            let parent_node = &mut self.nodes[parent];
            if parent_node.wildcard_plus == Some(node_id) {
                parent_node.wildcard_plus = None;
            } else {
                parent_node.children.remove(&node.level);
            }

            dirty.remove(&node_id);
            dirty.insert(parent);

            node_id = parent;
        }

        removals
    }

    fn update_for(&self, dirty: HashSet<NodeId>, removals: Vec<String>) -> TreeUpdate {
        let upserts = dirty
            .into_iter()
            .map(|node_id| self.document_for(node_id))
            .collect();

        TreeUpdate { upserts, removals }
    }

    fn document_for(&self, node_id: NodeId) -> NodeDocument {
        let node = &self.nodes[node_id];

        let children = node
            .children
            .iter()
            .map(|(level, &child)| (level.clone(), self.nodes[child].path.clone()))
            .collect();

        let (path, level) = if node_id == self.root {
            // The root cannot use its real (empty) path: a filter with a
            // leading empty level materializes a node whose path is also "".
            ("#".to_owned(), "#".to_owned())
        } else {
            (node.path.clone(), node.level.clone())
        };

        NodeDocument {
            path,
            level,
            children,
            wildcard_plus: node
                .wildcard_plus
                .map(|plus| self.nodes[plus].path.clone()),
            wildcard_hash: node.wildcard_hash.clone(),
            terminals: node.terminals.clone(),
        }
    }
}

/// Replace an existing `(client_id, filter)` entry or append a new one.
fn upsert_subscription(list: &mut Vec<Subscription>, subscription: &Subscription) {
    match list.iter_mut().find(|existing| {
        existing.client_id == subscription.client_id
            && existing.topic_filter == subscription.topic_filter
    }) {
        Some(existing) => existing.qos = subscription.qos,
        None => list.push(subscription.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client_id: &str, filter: &str, qos: u8) -> Subscription {
        Subscription {
            client_id: client_id.into(),
            topic_filter: filter.into(),
            qos,
        }
    }

    fn insert(tree: &mut SubscriptionTree, client_id: &str, filter: &str, qos: u8) {
        let parsed: Filter = filter.parse().unwrap();
        tree.insert(&parsed, sub(client_id, filter, qos));
    }

    fn matched(tree: &SubscriptionTree, topic: &str) -> Vec<(String, String)> {
        let mut out: Vec<_> = tree
            .matches(topic)
            .into_iter()
            .map(|s| (s.client_id, s.topic_filter))
            .collect();
        out.sort();
        out
    }

    #[test]
    fn literal_filters_match_their_own_topic() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "sport/football", 0);
        insert(&mut tree, "c2", "sport/tennis", 0);

        assert_eq!(
            matched(&tree, "sport/football"),
            [("c1".to_owned(), "sport/football".to_owned())]
        );
        assert_eq!(matched(&tree, "sport/golf"), []);
    }

    #[test]
    fn plus_matches_any_single_level() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/+/c", 1);

        for topic in ["a/b/c", "a/x/c", "a//c"] {
            assert_eq!(
                matched(&tree, topic),
                [("c1".to_owned(), "a/+/c".to_owned())],
                "{topic}"
            );
        }

        assert_eq!(matched(&tree, "a/b/d"), []);
        assert_eq!(matched(&tree, "a/b/c/d"), []);
        assert_eq!(matched(&tree, "a/c"), []);
    }

    #[test]
    fn hash_matches_parent_and_descendants() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/#", 0);

        for topic in ["a", "a/x", "a/x/y", "a/x/y/z"] {
            assert_eq!(
                matched(&tree, topic),
                [("c1".to_owned(), "a/#".to_owned())],
                "{topic}"
            );
        }

        assert_eq!(matched(&tree, "b"), []);
    }

    #[test]
    fn bare_hash_matches_everything_unreserved() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "#", 0);

        assert_eq!(matched(&tree, "a"), [("c1".to_owned(), "#".to_owned())]);
        assert_eq!(
            matched(&tree, "x/y/z"),
            [("c1".to_owned(), "#".to_owned())]
        );
    }

    #[test]
    fn wildcards_do_not_match_reserved_topics() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "+/b", 0);
        insert(&mut tree, "c2", "#", 0);
        insert(&mut tree, "c3", "$SYS/b", 0);
        insert(&mut tree, "c4", "$SYS/#", 0);

        assert_eq!(
            matched(&tree, "$SYS/b"),
            [
                ("c3".to_owned(), "$SYS/b".to_owned()),
                ("c4".to_owned(), "$SYS/#".to_owned()),
            ]
        );

        // The same filters all match an unreserved topic.
        assert_eq!(
            matched(&tree, "a/b"),
            [
                ("c1".to_owned(), "+/b".to_owned()),
                ("c2".to_owned(), "#".to_owned()),
            ]
        );
    }

    #[test]
    fn overlapping_filters_are_deduplicated_per_client_filter_pair() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/b", 0);
        insert(&mut tree, "c1", "a/+", 1);
        insert(&mut tree, "c1", "a/b", 2); // re-subscription replaces

        let results = tree.matches("a/b");
        assert_eq!(results.len(), 2);

        let exact = results
            .iter()
            .find(|s| s.topic_filter == "a/b")
            .expect("exact filter present");
        assert_eq!(exact.qos, 2);
    }

    #[test]
    fn empty_levels_are_real_levels() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "/", 0);
        insert(&mut tree, "c2", "/+", 0);

        assert_eq!(
            matched(&tree, "/"),
            [
                ("c1".to_owned(), "/".to_owned()),
                ("c2".to_owned(), "/+".to_owned()),
            ]
        );
    }

    #[test]
    fn insert_then_delete_restores_match_output() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/b", 0);
        insert(&mut tree, "c2", "a/#", 1);

        let topics = ["a", "a/b", "a/b/c", "x", "/"];
        let baseline: Vec<_> = topics.iter().map(|t| matched(&tree, t)).collect();
        let baseline_nodes = tree.node_count();

        insert(&mut tree, "c3", "a/+/c", 2);
        let filter: Filter = "a/+/c".parse().unwrap();
        let (removed, _) = tree.delete(&filter, "c3");
        assert!(removed);

        let after: Vec<_> = topics.iter().map(|t| matched(&tree, t)).collect();
        assert_eq!(baseline, after);

        // Empty intermediate nodes from `a/+/c` must have been pruned.
        assert_eq!(tree.node_count(), baseline_nodes);
    }

    #[test]
    fn delete_of_unknown_subscription_is_a_noop() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/b", 0);

        let filter: Filter = "a/b".parse().unwrap();
        let (removed, update) = tree.delete(&filter, "someone-else");
        assert!(!removed);
        assert!(update.upserts.is_empty());

        let missing: Filter = "not/there".parse().unwrap();
        let (removed, _) = tree.delete(&missing, "c1");
        assert!(!removed);
    }

    #[test]
    fn delete_hash_filter_detaches_from_the_parent_node() {
        let mut tree = SubscriptionTree::new();
        insert(&mut tree, "c1", "a/#", 0);
        insert(&mut tree, "c2", "a", 0);

        let filter: Filter = "a/#".parse().unwrap();
        let (removed, _) = tree.delete(&filter, "c1");
        assert!(removed);

        assert_eq!(matched(&tree, "a/x"), []);
        assert_eq!(matched(&tree, "a"), [("c2".to_owned(), "a".to_owned())]);
    }

    #[test]
    fn mirror_documents_track_inserts_and_removals() {
        let mut tree = SubscriptionTree::new();

        let filter: Filter = "sport/football".parse().unwrap();
        let update = tree.insert(&filter, sub("c1", "sport/football", 1));

        let mut paths: Vec<_> = update.upserts.iter().map(|d| d.path.clone()).collect();
        paths.sort();
        // The root document (reserved path "#") changes too: it gained a child.
        assert_eq!(paths, ["#", "sport", "sport/football"]);

        let leaf = update
            .upserts
            .iter()
            .find(|d| d.path == "sport/football")
            .unwrap();
        assert_eq!(leaf.level, "football");
        assert_eq!(leaf.terminals, [sub("c1", "sport/football", 1)]);

        let (removed, update) = tree.delete(&filter, "c1");
        assert!(removed);
        let mut removals = update.removals.clone();
        removals.sort();
        assert_eq!(removals, ["sport", "sport/football"]);
    }
}
