// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares the exchange, queue and bindings a publisher or
//! consumer relies on, on every fresh session. Declarations are best-effort:
//! a passive declaration commonly fails when the resource does not exist yet,
//! so each failure is logged and the remaining declarations still run.

use crate::{
    channel::BrokerSession,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueDefinition, RoutingKeySet},
};
use tracing::{debug, warn};

/// Declares `name` on the session as described by `def`.
pub async fn declare_exchange(
    session: &dyn BrokerSession,
    name: &str,
    def: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!(passive = def.passive, "declaring exchange: {}", name);

    match session.declare_exchange(name, def).await {
        Err(err) => {
            if def.passive {
                warn!(error = err.to_string(), name, "passive declaration of exchange has failed");
            } else {
                warn!(error = err.to_string(), name, "declaration of exchange has failed");
            }
            Err(err)
        }
        Ok(_) => {
            debug!("exchange: {} was declared", name);
            Ok(())
        }
    }
}

/// Declares the queue `name` on the session as described by `def`.
pub async fn declare_queue(
    session: &dyn BrokerSession,
    name: &str,
    def: &QueueDefinition,
) -> Result<(), AmqpError> {
    debug!(passive = def.passive, "declaring queue: {}", name);

    match session.declare_queue(name, def).await {
        Err(err) => {
            if def.passive {
                warn!(error = err.to_string(), name, "passive declaration of queue has failed");
            } else {
                warn!(error = err.to_string(), name, "declaration of queue has failed");
            }
            Err(err)
        }
        Ok(_) => {
            debug!("queue: {} was declared", name);
            Ok(())
        }
    }
}

/// Binds `queue` to `exchange` once per routing key.
///
/// Every key is attempted; the failures are returned.
pub async fn bind(
    session: &dyn BrokerSession,
    queue: &str,
    exchange: &str,
    routing_keys: &RoutingKeySet,
) -> Vec<AmqpError> {
    let mut failures = vec![];

    for key in routing_keys.iter() {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            queue, exchange, key
        );

        if let Err(err) = session.bind_queue(queue, exchange, key).await {
            warn!(error = err.to_string(), key, queue, "binding of routing-key has failed");
            failures.push(err);
        }
    }

    failures
}

/// The exchange, queue and bindings one publisher or consumer declares.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    exchange_name: String,
    exchange: Option<ExchangeDefinition>,
    queue_name: Option<String>,
    queue: Option<QueueDefinition>,
    routing_keys: RoutingKeySet,
}

impl Topology {
    pub fn new(exchange_name: &str) -> Topology {
        Topology {
            exchange_name: exchange_name.to_owned(),
            ..Default::default()
        }
    }

    /// Declares the exchange on every session.
    pub fn exchange(mut self, def: Option<ExchangeDefinition>) -> Self {
        self.exchange = def;
        self
    }

    /// Binds `name` with the routing keys, declaring it when `def` is set.
    pub fn queue(mut self, name: &str, def: Option<QueueDefinition>) -> Self {
        self.queue_name = Some(name.to_owned());
        self.queue = def;
        self
    }

    pub fn routing_keys(mut self, keys: RoutingKeySet) -> Self {
        self.routing_keys = keys;
        self
    }

    /// Runs every declaration, returning the failures that were swallowed.
    pub async fn install(&self, session: &dyn BrokerSession) -> Vec<AmqpError> {
        let mut failures = vec![];

        if let Some(def) = &self.exchange {
            if let Err(err) = declare_exchange(session, &self.exchange_name, def).await {
                failures.push(err);
            }
        }

        let Some(queue_name) = &self.queue_name else {
            return failures;
        };

        if let Some(def) = &self.queue {
            if let Err(err) = declare_queue(session, queue_name, def).await {
                failures.push(err);
            }
        }

        failures.extend(bind(session, queue_name, &self.exchange_name, &self.routing_keys).await);

        failures
    }
}
