// Copyright (c) 2025, The RabbitHutch Authors
// MIT License
// All rights reserved.

//! # Trace Context Propagation
//!
//! Published messages carry the caller's trace context in their AMQP headers;
//! consumed messages get a consumer span parented to that context.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, Tracer},
    Context,
};
use std::{borrow::Cow, collections::BTreeMap};
use tracing::error;

/// Name of the tracer consumer spans are started with.
pub(crate) const CONSUMER_TRACER: &str = "amqp consumer";

/// Injects and extracts trace context through an AMQP header table.
pub(crate) struct HeaderPropagator<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderPropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderPropagator<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderPropagator<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        let AMQPValue::LongString(value) = self.headers.get(key)? else {
            return None;
        };

        match std::str::from_utf8(value.as_bytes()) {
            Ok(value) => Some(value),
            Err(err) => {
                error!(key, error = err.to_string(), "trace header is not valid utf-8");
                None
            }
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Starts a consumer span for one delivery, parented to the context found in
/// its headers.
pub(crate) fn new_span(props: &AMQPProperties, name: &str) -> (Context, BoxedSpan) {
    let tracer: BoxedTracer = global::tracer(CONSUMER_TRACER);

    let mut headers = props.headers().clone().unwrap_or_default().inner().clone();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderPropagator::new(&mut headers))
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(&tracer, &ctx);

    (ctx, span)
}

/// Marks the span failed with `description`.
pub(crate) fn fail_span(span: &mut BoxedSpan, description: &'static str) {
    span.set_status(Status::Error {
        description: Cow::from(description),
    });
}
