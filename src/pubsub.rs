// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Broadcast channels: a [`Publisher`] writes to a fanout exchange and every
//! [`Subscriber`] receives a copy through its own queue.

use crate::{
    connection::Connection,
    consumer::{Consumer, ConsumerOptions, MessageHandler},
    errors::AmqpError,
    exchange::Exchange,
    publisher::{Producer, ProducerOptions},
};
use opentelemetry::Context;
use tokio::task::JoinHandle;

/// Publishing side of a broadcast channel.
pub struct Publisher {
    producer: Producer,
}

impl Publisher {
    /// Declares the fanout exchange `exchange_name`. No queue is declared.
    pub async fn new(
        exchange_name: &str,
        connection: &Connection,
        options: ProducerOptions,
    ) -> Result<Publisher, AmqpError> {
        let producer = Producer::new(Exchange::fanout(exchange_name), "", connection, options).await?;
        Ok(Publisher { producer })
    }

    /// The fanout exchange name.
    pub fn exchange_name(&self) -> &str {
        self.producer.exchange().name()
    }

    /// Broadcasts `body` to every bound subscriber queue.
    pub async fn publish(&self, body: &[u8]) -> Result<(), AmqpError> {
        self.producer.publish_fanout(body).await
    }

    /// Same as [`Publisher::publish`], propagating `ctx`.
    pub async fn publish_with_context(&self, ctx: &Context, body: &[u8]) -> Result<(), AmqpError> {
        self.producer.publish_fanout_with_context(ctx, body).await
    }

    /// Closes the underlying channel. Later calls are no-ops.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.producer.close().await
    }
}

/// Receiving side of a broadcast channel.
pub struct Subscriber {
    consumer: Consumer,
}

impl Subscriber {
    /// Prepares a consumer of `queue_name` bound to the fanout exchange
    /// `exchange_name`. Nothing is declared until [`Subscriber::subscribe`].
    pub fn new(
        exchange_name: &str,
        queue_name: &str,
        connection: &Connection,
        options: ConsumerOptions,
    ) -> Result<Subscriber, AmqpError> {
        let consumer = Consumer::new(Exchange::fanout(exchange_name), queue_name, connection, options)?;
        Ok(Subscriber { consumer })
    }

    /// The subscriber's own queue.
    pub fn queue_name(&self) -> &str {
        self.consumer.queue_name()
    }

    /// Starts the self-healing consume loop, see [`Consumer::consume`].
    pub fn subscribe<H>(&self, handler: H) -> Result<JoinHandle<()>, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        self.consumer.consume(handler)
    }

    /// Stops the consume loop, see [`Consumer::close`].
    pub async fn close(&self) {
        self.consumer.close().await
    }
}
