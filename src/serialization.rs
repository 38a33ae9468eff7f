// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Payload Callbacks
//!
//! Publishers and consumers are generic over the domain type `T` and plug in
//! how it turns into bytes, back into `T`, and which routing key it is
//! published with. JSON and the wildcard routing key are the defaults.

use crate::{errors::AmqpError, queue::WILDCARD_ROUTING_KEY};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Default content encoding of serialized payloads
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";

/// `T -> bytes`
pub type Serializer<T> = Arc<dyn Fn(&T) -> Result<Vec<u8>, AmqpError> + Send + Sync>;

/// `bytes -> T`, `None` when the payload cannot be decoded.
pub type Deserializer<T> = Arc<dyn Fn(&[u8]) -> Option<T> + Send + Sync>;

/// `T -> routing key`
pub type RoutingKeyGenerator<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;

pub fn json_serializer<T>() -> Serializer<T>
where
    T: Serialize + 'static,
{
    Arc::new(|item: &T| {
        serde_json::to_vec(item).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })
    })
}

pub fn json_deserializer<T>() -> Deserializer<T>
where
    T: DeserializeOwned + 'static,
{
    Arc::new(|bytes: &[u8]| match serde_json::from_slice::<T>(bytes) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(error = err.to_string(), "failure to deserialize payload");
            None
        }
    })
}

/// Every message goes out with the wildcard key `#`.
pub fn wildcard_routing_key<T: 'static>() -> RoutingKeyGenerator<T> {
    constant_routing_key(WILDCARD_ROUTING_KEY)
}

/// Every message goes out with `key`.
pub fn constant_routing_key<T: 'static>(key: &str) -> RoutingKeyGenerator<T> {
    let key = key.to_owned();
    Arc::new(move |_: &T| key.clone())
}

/// Derives the routing key from the message itself.
pub fn routing_key_from<T, F>(f: F) -> RoutingKeyGenerator<T>
where
    T: 'static,
    F: Fn(&T) -> String + Send + Sync + 'static,
{
    Arc::new(f)
}
