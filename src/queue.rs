// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Declare and Bind Options
//!
//! Option bundles controlling how a session declares its exchange and queue,
//! binds them, and redirects rejected messages to a dead-letter queue. Every
//! bundle follows the builder pattern and can also be deserialized from an
//! external configuration source. Extra broker arguments are set through the
//! builders only.

use crate::exchange::RoutingKind;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, ShortString},
};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Constant for the argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the argument used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the argument used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Exchange declaration flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) internal: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    #[serde(skip)]
    pub(crate) arguments: FieldTable,
}

impl ExchangeOptions {
    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Only checks that the exchange exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Does not wait for the broker's `declare-ok`.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds an extra broker argument to the declaration.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn declare_options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }
}

/// Queue declaration flags and limits.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    #[serde(skip)]
    pub(crate) arguments: FieldTable,
}

impl QueueOptions {
    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Does not wait for the broker's `declare-ok`.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Message TTL in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Maximum number of messages the queue holds.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Maximum size in bytes the queue holds.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds an extra broker argument to the declaration.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn declare_options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Limit arguments followed by the caller's extra arguments.
    pub(crate) fn declare_arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();

        if let Some(ttl) = self.ttl {
            args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(ttl),
            );
        }

        if let Some(max) = self.max_length {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(max),
            );
        }

        if let Some(max_bytes) = self.max_length_bytes {
            args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(max_bytes),
            );
        }

        for (key, value) in self.arguments.inner() {
            args.insert(key.clone(), value.clone());
        }

        args
    }
}

/// Queue binding flags.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BindOptions {
    pub(crate) no_wait: bool,
    #[serde(skip)]
    pub(crate) arguments: FieldTable,
}

impl BindOptions {
    /// Does not wait for the broker's `bind-ok`.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Adds an extra binding argument; header match arguments take precedence.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(ShortString::from(key), value);
        self
    }

    pub(crate) fn bind_options(&self) -> QueueBindOptions {
        QueueBindOptions {
            nowait: self.no_wait,
        }
    }
}

/// Dead-letter redirection of the primary queue.
///
/// Enabled only when both the exchange and the queue names are set; the
/// primary queue is then declared with `x-dead-letter-exchange` and
/// `x-dead-letter-routing-key`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeadLetterOptions {
    pub(crate) exchange_name: String,
    pub(crate) queue_name: String,
    pub(crate) routing_key: String,
    pub(crate) kind: RoutingKind,
    pub(crate) exchange: ExchangeOptions,
    pub(crate) queue: QueueOptions,
    pub(crate) bind: BindOptions,
}

impl DeadLetterOptions {
    /// Dead-lettering to `queue_name` through `exchange_name`.
    ///
    /// # Parameters
    /// * `exchange_name` - dead-letter exchange, declared direct by default
    /// * `queue_name` - queue receiving rejected and expired messages
    ///
    /// Both names must be non-empty for dead-lettering to be enabled.
    pub fn new(exchange_name: &str, queue_name: &str) -> Self {
        DeadLetterOptions {
            exchange_name: exchange_name.to_owned(),
            queue_name: queue_name.to_owned(),
            ..Default::default()
        }
    }

    /// Routing key used for dead-lettered messages, sent as
    /// `x-dead-letter-routing-key`.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Kind of the dead-letter exchange, direct by default.
    pub fn kind(mut self, kind: RoutingKind) -> Self {
        self.kind = kind;
        self
    }

    /// Declaration options of the dead-letter exchange.
    pub fn exchange_options(mut self, options: ExchangeOptions) -> Self {
        self.exchange = options;
        self
    }

    /// Declaration options of the dead-letter queue.
    pub fn queue_options(mut self, options: QueueOptions) -> Self {
        self.queue = options;
        self
    }

    /// Options of the dead-letter binding.
    pub fn bind_options(mut self, options: BindOptions) -> Self {
        self.bind = options;
        self
    }

    /// Whether both the exchange and the queue name are set.
    pub fn is_enabled(&self) -> bool {
        !self.exchange_name.is_empty() && !self.queue_name.is_empty()
    }
}

/// Everything a session needs to declare its exchange, queue and binding.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TopologyOptions {
    pub(crate) exchange: ExchangeOptions,
    pub(crate) queue: QueueOptions,
    pub(crate) bind: BindOptions,
    pub(crate) dead_letter: Option<DeadLetterOptions>,
}

impl TopologyOptions {
    /// Exchange declaration options.
    pub fn exchange(mut self, options: ExchangeOptions) -> Self {
        self.exchange = options;
        self
    }

    /// Queue declaration options.
    pub fn queue(mut self, options: QueueOptions) -> Self {
        self.queue = options;
        self
    }

    /// Binding options.
    pub fn bind(mut self, options: BindOptions) -> Self {
        self.bind = options;
        self
    }

    /// Enables dead-lettering for the primary queue.
    pub fn dead_letter(mut self, options: DeadLetterOptions) -> Self {
        self.dead_letter = Some(options);
        self
    }
}
