// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

mod otel;

pub mod channel;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod lifecycle;
pub mod management;
pub mod publisher;
pub mod queue;
pub mod queueing;
pub mod registry;
pub mod serialization;
pub mod single_fetch;
pub mod topology;
