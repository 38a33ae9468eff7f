// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Queue Declarations and Routing Keys
//!
//! This module provides the queue declaration parameters and the ordered set
//! of routing keys a consumer binds its queue with.

use crate::publisher::HeaderValue;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Routing key matching everything published to a topic exchange.
pub const WILDCARD_ROUTING_KEY: &str = "#";

/// Declaration parameters of a queue.
///
/// Defaults to an active declaration of a durable, exclusive classic queue.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueDefinition {
    pub passive: bool,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl Default for QueueDefinition {
    fn default() -> Self {
        QueueDefinition {
            passive: false,
            durable: true,
            exclusive: true,
            auto_delete: false,
            arguments: BTreeMap::default(),
        }
    }
}

impl QueueDefinition {
    /// Asserts the queue exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets whether the queue survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Sets whether the queue is exclusive to the declaring connection.
    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    /// Deletes the queue once the last consumer unsubscribes.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Adds a single declaration argument, e.g. `x-message-ttl`.
    pub fn argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

/// Ordered, duplicate-free set of routing keys.
///
/// Duplicates are dropped keeping the first occurrence. An empty set falls
/// back to the wildcard key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<String>")]
pub struct RoutingKeySet(Vec<String>);

impl RoutingKeySet {
    pub fn new<I, S>(keys: I) -> RoutingKeySet
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set: Vec<String> = vec![];
        for key in keys {
            let key = key.into();
            if !set.contains(&key) {
                set.push(key);
            }
        }

        if set.is_empty() {
            return RoutingKeySet::default();
        }

        RoutingKeySet(set)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Case-insensitive membership, as used when pruning bindings.
    pub fn contains_ignore_case(&self, key: &str) -> bool {
        self.0.iter().any(|k| k.eq_ignore_ascii_case(key))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for RoutingKeySet {
    fn default() -> Self {
        RoutingKeySet(vec![WILDCARD_ROUTING_KEY.to_owned()])
    }
}

impl From<Vec<String>> for RoutingKeySet {
    fn from(keys: Vec<String>) -> Self {
        RoutingKeySet::new(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routing_keys_keep_order_and_drop_duplicates() {
        let keys = RoutingKeySet::new(["b.*", "a.#", "b.*"]);

        assert_eq!(keys.iter().collect::<Vec<_>>(), vec!["b.*", "a.#"]);
    }

    #[test]
    fn empty_routing_keys_fall_back_to_wildcard() {
        let keys = RoutingKeySet::new(Vec::<String>::new());

        assert_eq!(keys, RoutingKeySet::default());
        assert_eq!(keys.iter().next(), Some(WILDCARD_ROUTING_KEY));
    }

    #[test]
    fn membership_ignores_case() {
        let keys = RoutingKeySet::new(["Orders.Created"]);

        assert!(keys.contains_ignore_case("orders.created"));
        assert!(!keys.contains_ignore_case("orders.deleted"));
    }
}
