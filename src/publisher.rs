// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Producer
//!
//! A [`Producer`] is a publishing session bound to one (exchange, queue)
//! pair. Its topology is declared once, when the producer is created, over a
//! channel owned by the producer. The channel is not re-created after a
//! broker disconnect: publishing on a stale channel fails and the caller
//! decides whether to retry or build a new producer.
//!
//! Each exchange kind has its own publish method; calling a method that does
//! not match the bound exchange fails with `TopologyMismatchError` before
//! anything is written to the network.

use crate::{
    channel::AmqpChannel,
    connection::Connection,
    errors::AmqpError,
    exchange::{insert_headers, Exchange, ExchangeKind, Headers, RoutingKind, AMQP_HEADERS_DELAY},
    otel,
    queue::{BindOptions, DeadLetterOptions, ExchangeOptions, QueueOptions, TopologyOptions},
    topology::Topology,
};
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Content type advertised on every message; payloads are opaque bytes.
pub const TEXT_CONTENT_TYPE: &str = "text/plain";

const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Construction options of a [`Producer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerOptions {
    pub(crate) topology: TopologyOptions,
    pub(crate) persistent: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            topology: TopologyOptions::default(),
            persistent: true,
        }
    }
}

impl ProducerOptions {
    /// Replaces the whole topology bundle.
    pub fn topology(mut self, topology: TopologyOptions) -> Self {
        self.topology = topology;
        self
    }

    /// Exchange declaration options.
    pub fn exchange(mut self, options: ExchangeOptions) -> Self {
        self.topology.exchange = options;
        self
    }

    /// Queue declaration options.
    pub fn queue(mut self, options: QueueOptions) -> Self {
        self.topology.queue = options;
        self
    }

    /// Binding options.
    pub fn bind(mut self, options: BindOptions) -> Self {
        self.topology.bind = options;
        self
    }

    /// Declares a dead-letter exchange and queue and points the queue at them.
    pub fn dead_letter(mut self, options: DeadLetterOptions) -> Self {
        self.topology.dead_letter = Some(options);
        self
    }

    /// Persistent (default) or transient delivery mode for every message.
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }
}

/// Publish-time routing of a delayed message whose inner kind needs one.
#[derive(Debug, Clone, Default)]
pub struct DelayedPublish {
    topic_key: Option<String>,
    headers: Option<Headers>,
}

impl DelayedPublish {
    /// Routing key, required when the delayed kind is topic.
    pub fn topic_key(mut self, key: &str) -> Self {
        self.topic_key = Some(key.to_owned());
        self
    }

    /// Message headers, required when the delayed kind is headers.
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// A publishing session bound to one exchange and queue.
pub struct Producer {
    exchange: Exchange,
    queue_name: String,
    channel: Arc<dyn AmqpChannel>,
    persistent: bool,
    closed: AtomicBool,
}

impl Producer {
    /// Opens a channel on `connection` and declares the exchange, the queue
    /// and their binding. On failure the channel is closed again.
    ///
    /// # Parameters
    /// * `exchange` - exchange descriptor; fixes which publish method is valid
    /// * `queue_name` - queue to declare and bind, or empty to skip both
    /// * `connection` - shared connection the channel is opened on
    /// * `options` - declaration options and delivery mode
    ///
    /// # Returns
    /// The ready producer, or the first connection/declaration error.
    #[tracing::instrument(
        name = "producer_new",
        skip_all,
        fields(exchange = exchange.name(), queue = queue_name)
    )]
    pub async fn new(
        exchange: Exchange,
        queue_name: &str,
        connection: &Connection,
        options: ProducerOptions,
    ) -> Result<Producer, AmqpError> {
        let channel = connection.create_channel().await?;

        let installed = Topology::new(&exchange, queue_name, &options.topology)
            .install(channel.as_ref())
            .await;

        if let Err(err) = installed {
            if let Err(close_err) = channel.close().await {
                warn!(error = close_err.to_string(), "failure to close the channel");
            }
            return Err(err);
        }

        debug!("producer ready");

        Ok(Producer {
            exchange,
            queue_name: queue_name.to_owned(),
            channel,
            persistent: options.persistent,
            closed: AtomicBool::new(false),
        })
    }

    /// The exchange this producer publishes to.
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// The queue declared and bound at construction; empty when none was.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Publishes with the exchange's routing key on a direct exchange.
    ///
    /// The current trace context travels in the message headers; see
    /// [`Producer::publish_direct_with_context`] to pass one explicitly.
    pub async fn publish_direct(&self, body: &[u8]) -> Result<(), AmqpError> {
        self.publish_direct_with_context(&Context::current(), body)
            .await
    }

    /// Same as [`Producer::publish_direct`], propagating `ctx`.
    pub async fn publish_direct_with_context(
        &self,
        ctx: &Context,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.exchange
            .ensure_kind(ExchangeKind::Direct, "publish_direct")?;
        self.publish(ctx, self.exchange.routing_key(), body, BTreeMap::new())
            .await
    }

    /// Publishes to every queue bound to a fanout exchange.
    pub async fn publish_fanout(&self, body: &[u8]) -> Result<(), AmqpError> {
        self.publish_fanout_with_context(&Context::current(), body)
            .await
    }

    /// Same as [`Producer::publish_fanout`], propagating `ctx`.
    pub async fn publish_fanout_with_context(
        &self,
        ctx: &Context,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.exchange
            .ensure_kind(ExchangeKind::Fanout, "publish_fanout")?;
        self.publish(ctx, "", body, BTreeMap::new()).await
    }

    /// Publishes with `topic_key` as routing key on a topic exchange.
    pub async fn publish_topic(&self, topic_key: &str, body: &[u8]) -> Result<(), AmqpError> {
        self.publish_topic_with_context(&Context::current(), topic_key, body)
            .await
    }

    /// Same as [`Producer::publish_topic`], propagating `ctx`.
    pub async fn publish_topic_with_context(
        &self,
        ctx: &Context,
        topic_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.exchange
            .ensure_kind(ExchangeKind::Topic, "publish_topic")?;
        self.publish(ctx, topic_key, body, BTreeMap::new()).await
    }

    /// Publishes with `headers` as message headers on a headers exchange.
    pub async fn publish_headers(&self, headers: &Headers, body: &[u8]) -> Result<(), AmqpError> {
        self.publish_headers_with_context(&Context::current(), headers, body)
            .await
    }

    /// Same as [`Producer::publish_headers`], propagating `ctx`.
    pub async fn publish_headers_with_context(
        &self,
        ctx: &Context,
        headers: &Headers,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        self.exchange
            .ensure_kind(ExchangeKind::Headers, "publish_headers")?;

        let mut table = BTreeMap::new();
        insert_headers(headers, &mut table);
        self.publish(ctx, "", body, table).await
    }

    /// Publishes on a delayed-message exchange; the broker routes the message
    /// per the exchange's inner kind once `delay` elapsed.
    ///
    /// # Parameters
    /// * `delay` - sent as `x-delay` in milliseconds, saturating
    /// * `body` - message payload
    /// * `options` - topic key or headers, required by topic and headers
    ///   inner kinds
    ///
    /// # Returns
    /// `ConfigError` when the inner kind's routing input is missing,
    /// `TopologyMismatchError` on a non-delayed exchange.
    pub async fn publish_delayed_message(
        &self,
        delay: Duration,
        body: &[u8],
        options: DelayedPublish,
    ) -> Result<(), AmqpError> {
        self.publish_delayed_message_with_context(&Context::current(), delay, body, options)
            .await
    }

    /// Same as [`Producer::publish_delayed_message`], propagating `ctx`.
    pub async fn publish_delayed_message_with_context(
        &self,
        ctx: &Context,
        delay: Duration,
        body: &[u8],
        options: DelayedPublish,
    ) -> Result<(), AmqpError> {
        self.exchange
            .ensure_kind(ExchangeKind::XMessageDelayed, "publish_delayed_message")?;

        let mut table = BTreeMap::new();
        let routing_key = match self.exchange.routing().kind() {
            RoutingKind::Direct => self.exchange.routing_key().to_owned(),
            RoutingKind::Fanout => String::new(),
            RoutingKind::Topic => options.topic_key.ok_or_else(|| {
                AmqpError::ConfigError("delayed topic message requires a topic key".to_owned())
            })?,
            RoutingKind::Headers => {
                let headers = options.headers.ok_or_else(|| {
                    AmqpError::ConfigError("delayed headers message requires headers".to_owned())
                })?;
                insert_headers(&headers, &mut table);
                String::new()
            }
        };

        table.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(delay_millis(delay)),
        );

        self.publish(ctx, &routing_key, body, table).await
    }

    /// Closes the producer's channel. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.close().await
    }

    async fn publish(
        &self,
        ctx: &Context,
        routing_key: &str,
        body: &[u8],
        mut headers: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("producer is closed".to_owned()));
        }

        otel::inject(ctx, &mut headers);

        let delivery_mode = if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(TEXT_CONTENT_TYPE))
            .with_delivery_mode(delivery_mode)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        self.channel
            .basic_publish(self.exchange.name(), routing_key, body, properties)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange.name(),
                    routing_key,
                    "error publishing message"
                );
                err
            })
    }
}

fn delay_millis(delay: Duration) -> i64 {
    i64::try_from(delay.as_millis()).unwrap_or(i64::MAX)
}
