// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Descriptors
//!
//! An [`Exchange`] is an immutable description of one routing topology: the
//! broker exchange name, its kind and the routing configuration used when a
//! queue is bound to it. Routing configuration is modelled as the [`Routing`]
//! sum type so a routing key only exists for direct/topic exchanges and a
//! header match only exists for headers exchanges.
//!
//! Delayed-message exchanges (a broker plugin) wrap an inner [`Routing`] and
//! delegate their routing semantics to it.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt};

/// Exchange type registered by the delayed message plugin
pub const AMQP_DELAYED_MESSAGE_EXCHANGE: &str = "x-delayed-message";
/// Declare argument naming the inner kind of a delayed exchange
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Publish header carrying the delay in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Bind argument selecting how header exchanges match
pub const AMQP_HEADERS_MATCH: &str = "x-match";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: exact match of routing keys
/// - Fanout: every bound queue, routing keys ignored
/// - Topic: wildcard pattern matching of routing keys
/// - Headers: header values instead of routing keys
/// - XMessageDelayed: delayed delivery (plugin required) routing like an inner kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl ExchangeKind {
    /// Wire name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::XMessageDelayed => AMQP_DELAYED_MESSAGE_EXCHANGE,
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom(AMQP_DELAYED_MESSAGE_EXCHANGE.to_owned())
            }
        }
    }
}

/// The routing semantics an exchange (or a delayed exchange's inner kind) uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl RoutingKind {
    /// Wire name of the exchange type.
    pub fn as_str(&self) -> &'static str {
        ExchangeKind::from(*self).as_str()
    }
}

impl From<RoutingKind> for ExchangeKind {
    fn from(kind: RoutingKind) -> Self {
        match kind {
            RoutingKind::Direct => ExchangeKind::Direct,
            RoutingKind::Fanout => ExchangeKind::Fanout,
            RoutingKind::Topic => ExchangeKind::Topic,
            RoutingKind::Headers => ExchangeKind::Headers,
        }
    }
}

impl fmt::Display for RoutingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a headers binding matches message headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    All,
    Any,
}

impl MatchMode {
    /// Value of the `x-match` binding argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMode::All => "all",
            MatchMode::Any => "any",
        }
    }
}

/// A single header value, published as message header or used as a binding argument.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Bool(bool),
    Int(i32),
    Long(i64),
    UInt(u32),
    Float(f64),
}

/// Header name to value mapping.
pub type Headers = BTreeMap<String, HeaderValue>;

impl From<&HeaderValue> for AMQPValue {
    fn from(value: &HeaderValue) -> Self {
        match value {
            HeaderValue::Str(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongInt(*v),
            HeaderValue::Long(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::UInt(v) => AMQPValue::LongUInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Str(v.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Str(v)
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Long(v)
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        HeaderValue::UInt(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

/// Copies caller headers into an AMQP argument/header table.
pub(crate) fn insert_headers(headers: &Headers, table: &mut BTreeMap<ShortString, AMQPValue>) {
    for (key, value) in headers {
        table.insert(ShortString::from(key.as_str()), AMQPValue::from(value));
    }
}

/// Header binding configuration of a headers exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderMatch {
    pub(crate) mode: MatchMode,
    pub(crate) headers: Headers,
}

impl HeaderMatch {
    /// Empty match with the given mode.
    pub fn new(mode: MatchMode) -> Self {
        HeaderMatch {
            mode,
            headers: Headers::default(),
        }
    }

    /// Matches when every header is present and equal.
    pub fn all() -> Self {
        Self::new(MatchMode::All)
    }

    /// Matches when at least one header is present and equal.
    pub fn any() -> Self {
        Self::new(MatchMode::Any)
    }

    /// Adds one header the binding matches on.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// How the headers are combined.
    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Headers a message must carry to be routed.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Binding arguments: the match headers plus the reserved `x-match` key.
    pub(crate) fn to_arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();
        insert_headers(&self.headers, &mut args);
        args.insert(
            ShortString::from(AMQP_HEADERS_MATCH),
            AMQPValue::LongString(LongString::from(self.mode.as_str())),
        );
        FieldTable::from(args)
    }
}

/// Routing configuration, one variant per routing kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Routing {
    Direct { routing_key: String },
    Topic { routing_key: String },
    Fanout,
    Headers(HeaderMatch),
}

impl Routing {
    /// The routing kind of this configuration.
    pub fn kind(&self) -> RoutingKind {
        match self {
            Routing::Direct { .. } => RoutingKind::Direct,
            Routing::Topic { .. } => RoutingKind::Topic,
            Routing::Fanout => RoutingKind::Fanout,
            Routing::Headers(_) => RoutingKind::Headers,
        }
    }

    /// The binding routing key; empty for fanout and headers routing.
    pub fn routing_key(&self) -> &str {
        match self {
            Routing::Direct { routing_key } | Routing::Topic { routing_key } => routing_key,
            Routing::Fanout | Routing::Headers(_) => "",
        }
    }

    /// Header match of headers routing, `None` otherwise.
    pub fn header_match(&self) -> Option<&HeaderMatch> {
        match self {
            Routing::Headers(matching) => Some(matching),
            _ => None,
        }
    }
}

/// Immutable descriptor of a broker exchange and the way queues bind to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    name: String,
    routing: Routing,
    delayed: bool,
}

impl Exchange {
    /// Direct exchange; an empty name addresses the broker's default exchange.
    pub fn direct(name: &str, routing_key: &str) -> Self {
        Self::plain(
            name,
            Routing::Direct {
                routing_key: routing_key.to_owned(),
            },
        )
    }

    /// Topic exchange; `pattern` is the binding key (e.g. `orders.*`).
    pub fn topic(name: &str, pattern: &str) -> Self {
        Self::plain(
            name,
            Routing::Topic {
                routing_key: pattern.to_owned(),
            },
        )
    }

    /// Fanout exchange: every bound queue gets a copy, routing keys are ignored.
    pub fn fanout(name: &str) -> Self {
        Self::plain(name, Routing::Fanout)
    }

    /// Headers exchange: queues bind with `matching` as `x-match` arguments.
    pub fn headers(name: &str, matching: HeaderMatch) -> Self {
        Self::plain(name, Routing::Headers(matching))
    }

    /// Delayed-message exchange routing like `inner` once the delay elapsed.
    ///
    /// This requires the x-delayed-message plugin on the RabbitMQ server.
    pub fn delayed(name: &str, inner: Routing) -> Self {
        Exchange {
            name: name.to_owned(),
            routing: inner,
            delayed: true,
        }
    }

    fn plain(name: &str, routing: Routing) -> Self {
        Exchange {
            name: name.to_owned(),
            routing,
            delayed: false,
        }
    }

    /// Exchange name; empty for the broker's default exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The declared kind, `XMessageDelayed` for delayed exchanges.
    pub fn kind(&self) -> ExchangeKind {
        if self.delayed {
            ExchangeKind::XMessageDelayed
        } else {
            self.routing.kind().into()
        }
    }

    /// Inner kind of a delayed-message exchange.
    pub fn delayed_kind(&self) -> Option<RoutingKind> {
        self.delayed.then(|| self.routing.kind())
    }

    /// Effective routing configuration (the inner one for delayed exchanges).
    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// Binding routing key; empty for fanout and headers routing.
    pub fn routing_key(&self) -> &str {
        self.routing.routing_key()
    }

    /// Header match of a headers exchange, delayed or not.
    pub fn header_match(&self) -> Option<&HeaderMatch> {
        self.routing.header_match()
    }

    /// Whether this descriptor addresses the broker's default exchange.
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    pub(crate) fn validate(&self) -> Result<(), AmqpError> {
        if self.is_default() && self.kind() != ExchangeKind::Direct {
            return Err(AmqpError::ConfigError(format!(
                "only direct exchanges may use the default (empty) name, got `{}`",
                self.kind()
            )));
        }
        Ok(())
    }

    /// Arguments sent with the exchange declaration.
    pub(crate) fn declare_arguments(&self) -> BTreeMap<ShortString, AMQPValue> {
        let mut args = BTreeMap::new();
        if self.delayed {
            args.insert(
                ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
                AMQPValue::LongString(LongString::from(self.routing.kind().as_str())),
            );
        }
        args
    }

    /// Routing key and arguments used to bind a queue to this exchange.
    pub(crate) fn binding(&self) -> (&str, FieldTable) {
        match &self.routing {
            Routing::Headers(matching) => ("", matching.to_arguments()),
            routing => (routing.routing_key(), FieldTable::default()),
        }
    }

    /// Fails unless the exchange is of kind `expected`.
    pub(crate) fn ensure_kind(&self, expected: ExchangeKind, method: &str) -> Result<(), AmqpError> {
        if self.kind() == expected {
            return Ok(());
        }
        Err(AmqpError::TopologyMismatchError {
            method: method.to_owned(),
            kind: self.kind().to_string(),
        })
    }
}
