// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! Propagates trace context through AMQP headers: outgoing wire messages get the current
//! context injected and every delivery is processed inside a consumer span whose parent
//! is extracted from the delivery's headers.

use lapin::{
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{SpanKind, Tracer},
    Context,
};
use std::borrow::Cow;
use tracing::error;

/// Name of the tracer used for delivery spans.
pub(crate) const TRACER_NAME: &str = "amqp channel";

/// Writes trace context entries into an AMQP header table.
pub(crate) struct HeaderInjector<'a> {
    headers: &'a mut FieldTable,
}

impl<'a> HeaderInjector<'a> {
    pub(crate) fn new(headers: &'a mut FieldTable) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            ShortString::from(key.to_lowercase()),
            AMQPValue::LongString(LongString::from(value)),
        );
    }
}

/// Reads trace context entries from an AMQP header table.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a FieldTable,
}

impl<'a> HeaderExtractor<'a> {
    pub(crate) fn new(headers: &'a FieldTable) -> Self {
        Self { headers }
    }
}

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.inner().get(key) {
            Some(AMQPValue::LongString(value)) => std::str::from_utf8(value.as_bytes())
                .map_err(|e| error!("Error decoding header value {:?}", e))
                .ok(),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        self.headers
            .inner()
            .keys()
            .map(|header| header.as_str())
            .collect()
    }
}

/// Injects the current trace context into the given header table.
pub(crate) fn inject_current_context(headers: &mut FieldTable) {
    let ctx = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&ctx, &mut HeaderInjector::new(headers))
    });
}

/// Starts a consumer span for a delivery, parented on the context carried in its headers.
pub(crate) fn new_span(props: &AMQPProperties, tracer: &BoxedTracer, name: &str) -> BoxedSpan {
    let headers = props.headers().clone().unwrap_or_default();
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor::new(&headers))
    });

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_values_are_readable_by_the_extractor() {
        let mut headers = FieldTable::default();
        HeaderInjector::new(&mut headers).set("TraceParent", "00-abc-def-01".to_owned());

        let extractor = HeaderExtractor::new(&headers);

        assert_eq!(extractor.get("traceparent"), Some("00-abc-def-01"));
        assert_eq!(extractor.keys(), vec!["traceparent"]);
    }

    #[test]
    fn extractor_ignores_non_string_headers() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("x-count"), AMQPValue::LongInt(3));

        assert_eq!(HeaderExtractor::new(&headers).get("x-count"), None);
    }
}
