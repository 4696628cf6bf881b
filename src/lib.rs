// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client: one self-healing [`Connection`], producer and
//! consumer sessions over direct, topic, fanout, headers and delayed-message
//! exchanges, dead-lettering and per-consumer QoS.

mod otel;

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod publisher;
pub mod pubsub;
pub mod queue;
pub mod topology;
pub mod transport;

#[cfg(test)]
mod testing;

pub use connection::{Connection, ConnectionOptions};
pub use consumer::{
    ConsumeOptions, Consumer, ConsumerOptions, HandlerErrorPolicy, MessageHandler, QosOptions,
};
pub use errors::{AmqpError, HandlerError};
pub use exchange::{Exchange, ExchangeKind, HeaderMatch, HeaderValue, Headers, MatchMode, Routing, RoutingKind};
pub use publisher::{DelayedPublish, Producer, ProducerOptions};
pub use pubsub::{Publisher, Subscriber};
pub use queue::{BindOptions, DeadLetterOptions, ExchangeOptions, QueueOptions, TopologyOptions};
pub use transport::TlsConfig;
