// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! Declares the topology of one producer or consumer session over its
//! channel, in order:
//! 1. the session exchange (skipped for the default exchange)
//! 2. the dead-letter exchange, queue and binding, when configured
//! 3. the session queue, with dead-letter and limit arguments
//! 4. the queue binding, keyed by the exchange's routing configuration
//!
//! Declarations are idempotent on the broker side, so the same topology is
//! installed again every time a consumer re-initializes.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    exchange::{Exchange, ExchangeKind},
    queue::{DeadLetterOptions, TopologyOptions},
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use std::collections::BTreeMap;
use tracing::{debug, error};

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the argument used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";

/// The topology of one session: its exchange, queue and declare options.
pub(crate) struct Topology<'tp> {
    exchange: &'tp Exchange,
    queue_name: &'tp str,
    options: &'tp TopologyOptions,
}

impl<'tp> Topology<'tp> {
    pub(crate) fn new(
        exchange: &'tp Exchange,
        queue_name: &'tp str,
        options: &'tp TopologyOptions,
    ) -> Topology<'tp> {
        Topology {
            exchange,
            queue_name,
            options,
        }
    }

    /// Installs the topology over `channel`.
    ///
    /// An empty queue name only declares the exchange.
    pub(crate) async fn install(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        self.exchange.validate()?;
        self.install_exchange(channel).await?;

        if self.queue_name.is_empty() {
            return Ok(());
        }

        let mut queue_args = self.options.queue.declare_arguments();

        if let Some(dead_letter) = self
            .options
            .dead_letter
            .as_ref()
            .filter(|dead_letter| dead_letter.is_enabled())
        {
            self.declare_dead_letter(channel, dead_letter, &mut queue_args)
                .await?;
        }

        self.install_queue(channel, queue_args).await?;
        self.binding_queue(channel).await
    }

    async fn install_exchange(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        if self.exchange.is_default() {
            debug!("using the default exchange");
            return Ok(());
        }

        let name = self.exchange.name();
        debug!("creating exchange: {}", name);

        let mut args: BTreeMap<ShortString, AMQPValue> =
            self.options.exchange.arguments.inner().clone();
        args.extend(self.exchange.declare_arguments());

        channel
            .exchange_declare(
                name,
                self.exchange.kind(),
                self.options.exchange.declare_options(),
                FieldTable::from(args),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name, "error to declare the exchange"
                );
                err
            })?;

        debug!("exchange: {} was created", name);
        Ok(())
    }

    async fn install_queue(
        &self,
        channel: &dyn AmqpChannel,
        queue_args: BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        debug!("creating queue: {}", self.queue_name);

        channel
            .queue_declare(
                self.queue_name,
                self.options.queue.declare_options(),
                FieldTable::from(queue_args),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = self.queue_name,
                    "error to declare the queue"
                );
                err
            })?;

        debug!("queue: {} was created", self.queue_name);
        Ok(())
    }

    /// Declares the dead-letter exchange and queue, binds them, and points
    /// the primary queue at them through `queue_args`.
    async fn declare_dead_letter(
        &self,
        channel: &dyn AmqpChannel,
        dead_letter: &DeadLetterOptions,
        queue_args: &mut BTreeMap<ShortString, AMQPValue>,
    ) -> Result<(), AmqpError> {
        debug!(
            "creating dead letter exchange: {} and queue: {}",
            dead_letter.exchange_name, dead_letter.queue_name
        );

        channel
            .exchange_declare(
                &dead_letter.exchange_name,
                ExchangeKind::from(dead_letter.kind),
                dead_letter.exchange.declare_options(),
                dead_letter.exchange.arguments.clone(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    "failure to declare dead letter exchange"
                );
                err
            })?;

        channel
            .queue_declare(
                &dead_letter.queue_name,
                dead_letter.queue.declare_options(),
                FieldTable::from(dead_letter.queue.declare_arguments()),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    "failure to declare dead letter queue"
                );
                err
            })?;

        channel
            .queue_bind(
                &dead_letter.queue_name,
                &dead_letter.exchange_name,
                &dead_letter.routing_key,
                dead_letter.bind.bind_options(),
                dead_letter.bind.arguments.clone(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    "failure to bind dead letter queue"
                );
                err
            })?;

        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(dead_letter.exchange_name.as_str())),
        );
        queue_args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(dead_letter.routing_key.as_str())),
        );

        Ok(())
    }

    async fn binding_queue(&self, channel: &dyn AmqpChannel) -> Result<(), AmqpError> {
        if self.exchange.is_default() {
            return Ok(());
        }

        let (routing_key, match_args) = self.exchange.binding();
        let mut args: BTreeMap<ShortString, AMQPValue> =
            self.options.bind.arguments.inner().clone();
        args.extend(match_args.inner().clone());

        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            self.queue_name,
            self.exchange.name(),
            routing_key
        );

        channel
            .queue_bind(
                self.queue_name,
                self.exchange.name(),
                routing_key,
                self.options.bind.bind_options(),
                FieldTable::from(args),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                err
            })?;

        debug!("queue was bounded");
        Ok(())
    }
}
