// Copyright (c) 2025, The Rabbids Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Propagation
//!
//! Trace context travels inside AMQP message headers: the producer injects
//! the current context into every publishing and the consumer opens a
//! consumer-kind span parented on whatever context the headers carry.

use std::borrow::Cow;
use std::collections::BTreeMap;

use lapin::types::{AMQPValue, ShortString};
use lapin::BasicProperties;
use opentelemetry::global::{self, BoxedSpan, BoxedTracer};
use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::{SpanKind, Tracer};
use opentelemetry::Context;
use tracing::debug;

/// Adapter exposing an AMQP header table as a propagation carrier.
///
/// Propagation fields share the header table with user headers and broker
/// arguments, so the carrier enforces this crate's conventions: keys are
/// stored lowercased (the form the broker hands back on delivery), and the
/// `x-*` namespace stays reserved for broker arguments like the ones
/// [`field_table`](crate::topology::field_table) produces.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> HeaderCarrier<'a> {
        HeaderCarrier { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        let key = key.to_lowercase();
        if key.starts_with("x-") {
            debug!(key = %key, "propagation field would shadow a broker argument, skipping");
            return;
        }

        self.headers
            .insert(key.into(), AMQPValue::LongString(value.into()));
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        match self.headers.get(key)? {
            AMQPValue::LongString(value) => std::str::from_utf8(value.as_bytes()).ok(),
            AMQPValue::ShortString(value) => Some(value.as_str()),
            _ => None,
        }
    }

    fn keys(&self) -> Vec<&str> {
        // Only string-valued headers can hold propagation fields; integer
        // broker arguments and the like are not worth offering to the
        // propagator.
        self.headers
            .iter()
            .filter(|(_, value)| {
                matches!(value, AMQPValue::LongString(_) | AMQPValue::ShortString(_))
            })
            .map(|(key, _)| key.as_str())
            .collect()
    }
}

/// Injects the current context into the given header table.
pub(crate) fn inject_context(headers: &mut BTreeMap<ShortString, AMQPValue>) {
    let context = Context::current();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut HeaderCarrier::new(headers))
    });
}

/// Starts a consumer span parented on the context extracted from the
/// delivery's headers.
pub(crate) fn consumer_span(
    tracer: &BoxedTracer,
    properties: &BasicProperties,
    name: &str,
) -> BoxedSpan {
    let mut headers = properties.headers().clone().unwrap_or_default().inner().clone();
    let parent = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderCarrier::new(&mut headers))
    });

    tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injected_fields_are_lowercased_and_readable_back() {
        let mut headers = BTreeMap::new();

        let mut carrier = HeaderCarrier::new(&mut headers);
        carrier.set("TraceParent", "00-4bf92f3577b34da6-00f067aa0ba902b7-01".to_owned());

        assert_eq!(
            carrier.get("traceparent"),
            Some("00-4bf92f3577b34da6-00f067aa0ba902b7-01")
        );
        assert!(headers.contains_key("traceparent"));
        assert!(!headers.contains_key("TraceParent"));
    }

    #[test]
    fn broker_arguments_are_not_shadowed() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(9_000),
        );

        let mut carrier = HeaderCarrier::new(&mut headers);
        carrier.set("X-Message-TTL", "stomped".to_owned());

        assert_eq!(
            headers.get("x-message-ttl"),
            Some(&AMQPValue::LongLongInt(9_000))
        );
    }

    #[test]
    fn extraction_reads_both_amqp_string_types_and_skips_the_rest() {
        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from("traceparent"),
            AMQPValue::LongString("long".into()),
        );
        headers.insert(
            ShortString::from("tracestate"),
            AMQPValue::ShortString("short".into()),
        );
        headers.insert(ShortString::from("x-max-length"), AMQPValue::LongLongInt(1));

        let carrier = HeaderCarrier::new(&mut headers);

        assert_eq!(carrier.get("traceparent"), Some("long"));
        assert_eq!(carrier.get("tracestate"), Some("short"));
        assert_eq!(carrier.get("x-max-length"), None);

        let mut keys = carrier.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["traceparent", "tracestate"]);
    }
}
