// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Instance Registry
//!
//! Holds constructed publishers and consumers under a name so application
//! code can look them up later. A registry is an ordinary value owned by the
//! application and passed where it is needed; there is no process-wide
//! instance. Instances registered without a name are keyed by the short name
//! of their message type.

use crate::{errors::AmqpError, publisher::Publisher};
use std::{
    any::{type_name, Any},
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, warn};

type Instance = Arc<dyn Any + Send + Sync>;

/// Key of instances registered for message type `T` without a name, e.g.
/// `Order` for `my_app::model::Order`.
pub fn default_name<T: ?Sized>() -> String {
    let full = type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}

#[derive(Default)]
pub struct Registry {
    instances: RwLock<HashMap<String, Instance>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    /// Stores `instance` under `name`, replacing any previous one.
    pub fn register<V>(&self, name: &str, instance: Arc<V>)
    where
        V: Any + Send + Sync,
    {
        let mut instances = self
            .instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if instances.insert(name.to_owned(), instance).is_some() {
            warn!(name, "registered instance was replaced");
        } else {
            debug!(name, kind = type_name::<V>(), "instance registered");
        }
    }

    /// The instance stored under `name`.
    ///
    /// Fails when nothing is registered under `name` or when it is not a `V`.
    pub fn get<V>(&self, name: &str) -> Result<Arc<V>, AmqpError>
    where
        V: Any + Send + Sync,
    {
        let instance = self
            .instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| AmqpError::UnknownInstance(name.to_owned()))?;

        instance
            .downcast::<V>()
            .map_err(|_| AmqpError::InstanceTypeMismatch(name.to_owned(), type_name::<V>().to_owned()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        self.instances
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Registers a direct or queueing publisher of `T`, under
    /// [`default_name::<T>`] when `name` is `None`. Returns the key used.
    pub fn register_publisher<T>(&self, name: Option<&str>, publisher: Arc<dyn Publisher<T>>) -> String
    where
        T: 'static,
    {
        let key = name.map(str::to_owned).unwrap_or_else(default_name::<T>);
        self.register(&key, Arc::new(publisher));
        key
    }

    /// The publisher of `T` stored under `name`, or under [`default_name::<T>`].
    pub fn publisher<T>(&self, name: Option<&str>) -> Result<Arc<dyn Publisher<T>>, AmqpError>
    where
        T: 'static,
    {
        let key = name.map(str::to_owned).unwrap_or_else(default_name::<T>);
        self.get::<Arc<dyn Publisher<T>>>(&key)
            .map(|publisher| publisher.as_ref().clone())
    }
}
