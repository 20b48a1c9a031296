// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration
//!
//! `TraceHook` is both a consume and a publish hook. On the publish path it
//! starts a producer span and injects its context into the message headers.
//! On the consume path it extracts that context from the headers, starts a
//! consumer span around the rest of the chain and stores the span context in
//! `Delivery::context`, so handlers can parent their own spans on it.
//!
//! Header propagation goes through the globally registered text map
//! propagator unless one is given to the hook.

use crate::{
    delivery::{Action, Delivery, DeliveryInfo},
    errors::AmqpError,
    handler::Consume,
    hook::{ConsumeHook, PublishHook},
    publisher::{Publish, PublishRequest},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use opentelemetry::{
    global::{self, BoxedTracer},
    propagation::{Extractor, Injector, TextMapPropagator},
    trace::{SpanKind, Status, TraceContextExt, Tracer},
    Context, KeyValue,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::error;

const INSTRUMENTATION_NAME: &str = "amqp-runtime";

const MESSAGING_SYSTEM: &str = "rabbitmq";
const OPERATION_PROCESS: &str = "process";
const OPERATION_PUBLISH: &str = "publish";

/// Adapter injecting and extracting trace context through AMQP headers.
pub(crate) struct HeaderCarrier<'a> {
    headers: &'a mut BTreeMap<ShortString, AMQPValue>,
}

impl<'a> HeaderCarrier<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<ShortString, AMQPValue>) -> Self {
        Self { headers }
    }
}

impl Injector for HeaderCarrier<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(
            key.to_lowercase().into(),
            AMQPValue::LongString(value.into()),
        );
    }
}

impl Extractor for HeaderCarrier<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|header_value| {
            if let AMQPValue::LongString(header_value) = header_value {
                std::str::from_utf8(header_value.as_bytes())
                    .map_err(|e| error!("Error decoding header value {:?}", e))
                    .ok()
            } else {
                None
            }
        })
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|header| header.as_str()).collect()
    }
}

/// Span name of a publish or a delivery: `exchange.key operation`.
fn span_name(exchange: &str, routing_key: &str, operation: &str) -> String {
    if exchange.is_empty() {
        return format!("{routing_key} {operation}");
    }
    format!("{exchange}.{routing_key} {operation}")
}

fn push_non_empty(attrs: &mut Vec<KeyValue>, key: &'static str, value: Option<&ShortString>) {
    if let Some(value) = value.filter(|v| !v.as_str().is_empty()) {
        attrs.push(KeyValue::new(key, value.as_str().to_owned()));
    }
}

fn common_attributes(
    operation: &'static str,
    exchange: &str,
    routing_key: &str,
    body_len: usize,
) -> Vec<KeyValue> {
    let mut attrs = vec![
        KeyValue::new("messaging.system", MESSAGING_SYSTEM),
        KeyValue::new("messaging.operation", operation),
        KeyValue::new("messaging.message.payload_size_bytes", body_len as i64),
    ];
    if !exchange.is_empty() {
        attrs.push(KeyValue::new(
            "messaging.destination.name",
            exchange.to_owned(),
        ));
    }
    if !routing_key.is_empty() {
        attrs.push(KeyValue::new(
            "messaging.rabbitmq.destination.routing_key",
            routing_key.to_owned(),
        ));
    }
    attrs
}

fn consume_attributes(info: &DeliveryInfo, body_len: usize) -> Vec<KeyValue> {
    let mut attrs = common_attributes(
        OPERATION_PROCESS,
        &info.exchange,
        &info.routing_key,
        body_len,
    );
    let props = &info.properties;

    push_non_empty(&mut attrs, "messaging.rabbitmq.app_id", props.app_id().as_ref());
    push_non_empty(&mut attrs, "messaging.message.id", props.message_id().as_ref());
    if info.redelivered {
        attrs.push(KeyValue::new("messaging.rabbitmq.redelivered", true));
    }
    if !info.consumer_tag.is_empty() {
        attrs.push(KeyValue::new(
            "messaging.consumer.id",
            info.consumer_tag.clone(),
        ));
    }
    push_non_empty(&mut attrs, "messaging.rabbitmq.client_id", props.user_id().as_ref());
    push_non_empty(
        &mut attrs,
        "messaging.message.conversation_id",
        props.correlation_id().as_ref(),
    );
    push_non_empty(&mut attrs, "messaging.rabbitmq.reply_to", props.reply_to().as_ref());
    attrs
}

fn publish_attributes(request: &PublishRequest) -> Vec<KeyValue> {
    let mut attrs = common_attributes(
        OPERATION_PUBLISH,
        &request.exchange,
        &request.routing_key,
        request.body.len(),
    );
    let props = &request.properties;

    push_non_empty(&mut attrs, "messaging.rabbitmq.app_id", props.app_id().as_ref());
    push_non_empty(&mut attrs, "messaging.message.id", props.message_id().as_ref());
    push_non_empty(&mut attrs, "messaging.rabbitmq.client_id", props.user_id().as_ref());
    push_non_empty(
        &mut attrs,
        "messaging.message.conversation_id",
        props.correlation_id().as_ref(),
    );
    push_non_empty(&mut attrs, "messaging.rabbitmq.reply_to", props.reply_to().as_ref());
    attrs
}

fn action_status(action: Action) -> Status {
    match action {
        Action::Ack => Status::Ok,
        Action::Nack | Action::Reject => Status::error(action.to_string()),
    }
}

/// Trace propagation for both hook chains.
#[derive(Clone)]
pub struct TraceHook {
    tracer: Arc<BoxedTracer>,
    propagator: Option<Arc<dyn TextMapPropagator + Send + Sync>>,
}

impl Default for TraceHook {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceHook {
    /// Uses the global tracer provider and the global propagator.
    pub fn new() -> Self {
        TraceHook {
            tracer: Arc::new(global::tracer(INSTRUMENTATION_NAME)),
            propagator: None,
        }
    }

    pub fn with_tracer(mut self, tracer: BoxedTracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TextMapPropagator + Send + Sync>) -> Self {
        self.propagator = Some(propagator);
        self
    }

    fn inject(&self, cx: &Context, headers: &mut BTreeMap<ShortString, AMQPValue>) {
        let mut carrier = HeaderCarrier::new(headers);
        match &self.propagator {
            Some(propagator) => propagator.inject_context(cx, &mut carrier),
            None => global::get_text_map_propagator(|propagator| {
                propagator.inject_context(cx, &mut carrier)
            }),
        }
    }

    fn extract(&self, cx: &Context, headers: FieldTable) -> Context {
        let mut headers = headers.inner().clone();
        let carrier = HeaderCarrier::new(&mut headers);
        match &self.propagator {
            Some(propagator) => propagator.extract_with_context(cx, &carrier),
            None => global::get_text_map_propagator(|propagator| {
                propagator.extract_with_context(cx, &carrier)
            }),
        }
    }
}

impl ConsumeHook for TraceHook {
    fn wrap_consume(&self, next: Arc<dyn Consume>) -> Arc<dyn Consume> {
        Arc::new(TracedConsume {
            hook: self.clone(),
            next,
        })
    }
}

impl PublishHook for TraceHook {
    fn wrap_publish(&self, next: Arc<dyn Publish>) -> Arc<dyn Publish> {
        Arc::new(TracedPublish {
            hook: self.clone(),
            next,
        })
    }
}

struct TracedConsume {
    hook: TraceHook,
    next: Arc<dyn Consume>,
}

#[async_trait]
impl Consume for TracedConsume {
    async fn serve(&self, delivery: &mut Delivery) -> Action {
        // An outer hook may already have opened a span for this delivery.
        let parent = if delivery.context.span().span_context().is_valid() {
            delivery.context.clone()
        } else {
            self.hook.extract(&delivery.context, delivery.info.headers())
        };

        let span = self
            .hook
            .tracer
            .span_builder(span_name(
                &delivery.info.exchange,
                &delivery.info.routing_key,
                OPERATION_PROCESS,
            ))
            .with_kind(SpanKind::Consumer)
            .with_attributes(consume_attributes(&delivery.info, delivery.body.len()))
            .start_with_context(self.hook.tracer.as_ref(), &parent);

        let cx = parent.with_span(span);
        delivery.context = cx.clone();

        let action = self.next.serve(delivery).await;

        let span = cx.span();
        span.set_status(action_status(action));
        span.end();
        action
    }
}

struct TracedPublish {
    hook: TraceHook,
    next: Arc<dyn Publish>,
}

#[async_trait]
impl Publish for TracedPublish {
    async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError> {
        let span = self
            .hook
            .tracer
            .span_builder(span_name(
                &request.exchange,
                &request.routing_key,
                OPERATION_PUBLISH,
            ))
            .with_kind(SpanKind::Producer)
            .with_attributes(publish_attributes(request))
            .start_with_context(self.hook.tracer.as_ref(), &request.context);

        let cx = request.context.with_span(span);
        let mut headers = request.headers().inner().clone();
        self.hook.inject(&cx, &mut headers);
        request.set_headers(FieldTable::from(headers));
        request.context = cx.clone();

        let result = self.next.publish(request).await;

        let span = cx.span();
        if let Err(err) = &result {
            span.set_status(Status::error(err.to_string()));
        }
        span.end();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::MockAcknowledger, channel::RawDelivery, log};
    use lapin::{types::LongString, BasicProperties};
    use opentelemetry::{
        propagation::text_map_propagator::FieldIter,
        trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState},
    };
    use parking_lot::Mutex;

    const TRACE_ID: &str = "4bf92f3577b34da6a3ce929d0e0e4736";
    const SPAN_ID: &str = "00f067aa0ba902b7";

    /// Carries `trace-span` in a single `X-Trace` header.
    #[derive(Debug)]
    struct SingleHeader {
        fields: Vec<String>,
    }

    impl SingleHeader {
        fn shared() -> Arc<dyn TextMapPropagator + Send + Sync> {
            Arc::new(SingleHeader {
                fields: vec!["x-trace".to_owned()],
            })
        }
    }

    impl TextMapPropagator for SingleHeader {
        fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
            let span = cx.span();
            let sc = span.span_context();
            if sc.is_valid() {
                injector.set("X-Trace", format!("{}-{}", sc.trace_id(), sc.span_id()));
            }
        }

        fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
            let Some((trace, span)) = extractor.get("x-trace").and_then(|v| v.split_once('-'))
            else {
                return cx.clone();
            };

            match (TraceId::from_hex(trace), SpanId::from_hex(span)) {
                (Ok(trace), Ok(span)) => cx.with_remote_span_context(SpanContext::new(
                    trace,
                    span,
                    TraceFlags::SAMPLED,
                    true,
                    TraceState::default(),
                )),
                _ => cx.clone(),
            }
        }

        fn fields(&self) -> FieldIter<'_> {
            FieldIter::new(&self.fields)
        }
    }

    fn remote_context() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex(TRACE_ID).unwrap(),
            SpanId::from_hex(SPAN_ID).unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn names_spans_after_destination() {
        assert_eq!(span_name("direct", "key", "process"), "direct.key process");
        assert_eq!(span_name("", "queue", "publish"), "queue publish");
    }

    #[test]
    fn consume_attributes_skip_empty_fields() {
        let info = DeliveryInfo {
            consumer_tag: "worker".to_owned(),
            exchange: "direct".to_owned(),
            routing_key: "key".to_owned(),
            redelivered: true,
            properties: BasicProperties::default().with_app_id(ShortString::from("billing")),
            ..DeliveryInfo::default()
        };

        let keys: Vec<String> = consume_attributes(&info, 6)
            .into_iter()
            .map(|kv| kv.key.as_str().to_owned())
            .collect();

        assert_eq!(
            keys,
            vec![
                "messaging.system",
                "messaging.operation",
                "messaging.message.payload_size_bytes",
                "messaging.destination.name",
                "messaging.rabbitmq.destination.routing_key",
                "messaging.rabbitmq.app_id",
                "messaging.rabbitmq.redelivered",
                "messaging.consumer.id",
            ]
        );
    }

    struct SeenContext(Arc<Mutex<Option<Context>>>);

    #[async_trait]
    impl Consume for SeenContext {
        async fn serve(&self, delivery: &mut Delivery) -> Action {
            *self.0.lock() = Some(delivery.context.clone());
            Action::Ack
        }
    }

    #[tokio::test]
    async fn consume_continues_the_remote_trace() {
        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from("x-trace"),
            AMQPValue::LongString(LongString::from(format!("{TRACE_ID}-{SPAN_ID}"))),
        );
        let mut delivery = Delivery::new(
            RawDelivery {
                delivery_tag: 1,
                redelivered: false,
                exchange: "direct".to_owned(),
                routing_key: "key".to_owned(),
                properties: BasicProperties::default().with_headers(headers),
                data: b"gopher".to_vec(),
                acknowledger: Arc::new(MockAcknowledger::new()),
            },
            "worker",
            log::noop(),
        );

        let seen = Arc::new(Mutex::new(None));
        let hook = TraceHook::new().with_propagator(SingleHeader::shared());
        let chain = hook.wrap_consume(Arc::new(SeenContext(seen.clone())));

        assert_eq!(chain.serve(&mut delivery).await, Action::Ack);

        let cx = seen.lock().take().unwrap();
        assert_eq!(
            cx.span().span_context().trace_id(),
            TraceId::from_hex(TRACE_ID).unwrap()
        );
    }

    struct SeenHeaders(Arc<Mutex<FieldTable>>);

    #[async_trait]
    impl Publish for SeenHeaders {
        async fn publish(&self, request: &mut PublishRequest) -> Result<(), AmqpError> {
            *self.0.lock() = request.headers();
            Ok(())
        }
    }

    #[tokio::test]
    async fn publish_injects_the_trace_into_headers() {
        let seen = Arc::new(Mutex::new(FieldTable::default()));
        let hook = TraceHook::new().with_propagator(SingleHeader::shared());
        let chain = hook.wrap_publish(Arc::new(SeenHeaders(seen.clone())));

        let mut request = PublishRequest::new("direct", "key", b"gopher".to_vec());
        request.context = remote_context();
        chain.publish(&mut request).await.unwrap();

        let headers = seen.lock().clone();
        let value = headers.inner().get("x-trace").cloned();
        assert!(matches!(
            value,
            Some(AMQPValue::LongString(v)) if v.as_bytes().starts_with(TRACE_ID.as_bytes())
        ));
    }

    #[tokio::test]
    async fn publish_without_trace_adds_no_header() {
        let seen = Arc::new(Mutex::new(FieldTable::default()));
        let hook = TraceHook::new().with_propagator(SingleHeader::shared());
        let chain = hook.wrap_publish(Arc::new(SeenHeaders(seen.clone())));

        let mut request = PublishRequest::new("direct", "key", vec![]);
        chain.publish(&mut request).await.unwrap();

        assert!(seen.lock().inner().get("x-trace").is_none());
    }
}
