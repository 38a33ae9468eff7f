// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! This module defines how an exchange is declared on a live channel. A
//! declaration is either *passive* (assert the exchange exists) or *active*
//! (create it with the given type, durability and arguments).

use crate::publisher::HeaderValue;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        }
    }
}

/// Declaration parameters of an exchange.
///
/// The exchange name is owned by the publisher/consumer settings; this struct
/// only describes *how* to declare it. Defaults to a passive, durable topic
/// exchange.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ExchangeDefinition {
    pub kind: ExchangeKind,
    pub passive: bool,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    pub arguments: BTreeMap<String, HeaderValue>,
}

impl Default for ExchangeDefinition {
    fn default() -> Self {
        ExchangeDefinition {
            kind: ExchangeKind::Topic,
            passive: true,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: BTreeMap::default(),
        }
    }
}

impl ExchangeDefinition {
    /// Creates an active (non-passive) declaration of the given kind.
    pub fn new(kind: ExchangeKind) -> ExchangeDefinition {
        ExchangeDefinition {
            kind,
            passive: false,
            ..Default::default()
        }
    }

    /// Asserts the exchange exists instead of creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sets whether the exchange survives a broker restart.
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Deletes the exchange once the last queue is unbound.
    pub fn auto_delete(mut self) -> Self {
        self.auto_delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Adds a single declaration argument.
    pub fn argument(mut self, key: &str, value: HeaderValue) -> Self {
        self.arguments.insert(key.to_owned(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_passive_durable_topic() {
        let def = ExchangeDefinition::default();

        assert!(def.passive);
        assert!(def.durable);
        assert_eq!(def.kind, ExchangeKind::Topic);
    }

    #[test]
    fn deserializes_with_defaults() {
        let def: ExchangeDefinition =
            serde_json::from_str(r#"{"kind":"fanout","passive":false}"#).unwrap();

        assert_eq!(def.kind, ExchangeKind::Fanout);
        assert!(!def.passive);
        assert!(def.durable);
    }
}
