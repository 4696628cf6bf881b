// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Client
//!
//! The `AmqpError` enum represents every failure the client surfaces: invalid
//! construction parameters, publish calls against the wrong exchange topology,
//! broker-side declare/bind rejections and transport-level failures. Transport
//! errors keep the broker/transport message verbatim.

use thiserror::Error;

/// Error returned by user message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid or missing construction parameters
    #[error("invalid configuration: {0}")]
    ConfigError(String),

    /// A publish method was invoked against an exchange of another kind
    #[error("`{method}` cannot be used on a `{kind}` exchange")]
    TopologyMismatchError { method: String, kind: String },

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating or closing a channel
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring an exchange
    #[error("failure to declare an exchange: {0}")]
    DeclareExchangeError(String),

    /// Error declaring a queue
    #[error("failure to declare a queue: {0}")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind queue `{1}` to exchange `{0}`: {2}")]
    BindingExchangeToQueueError(String, String, String),

    /// Error publishing a message
    #[error("failure to publish: {0}")]
    PublishingError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos: {0}")]
    QoSDeclarationError(String),

    /// Error registering a consumer on a queue
    #[error("failure to declare consumer: {0}")]
    ConsumerDeclarationError(String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// Error consuming a message
    #[error("failure to consume message: {0}")]
    ConsumerError(String),
}

impl AmqpError {
    /// Invalid construction parameters.
    pub fn is_config(&self) -> bool {
        matches!(self, AmqpError::ConfigError(_))
    }

    /// Publish method called on an exchange of another kind.
    pub fn is_topology_mismatch(&self) -> bool {
        matches!(self, AmqpError::TopologyMismatchError { .. })
    }

    /// Exchange or queue declaration refused by the broker.
    pub fn is_declare(&self) -> bool {
        matches!(
            self,
            AmqpError::DeclareExchangeError(_) | AmqpError::DeclareQueueError(_)
        )
    }

    /// Queue binding refused by the broker.
    pub fn is_bind(&self) -> bool {
        matches!(self, AmqpError::BindingExchangeToQueueError(..))
    }

    /// Whether the error comes from the protocol layer (dial, channel,
    /// publish, consume, ack) rather than from configuration or topology.
    pub fn is_transport(&self) -> bool {
        !(self.is_config() || self.is_topology_mismatch() || self.is_declare() || self.is_bind())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_variants_into_taxonomy() {
        assert!(AmqpError::ConfigError("empty url".into()).is_config());
        assert!(AmqpError::TopologyMismatchError {
            method: "publish_topic".into(),
            kind: "direct".into(),
        }
        .is_topology_mismatch());
        assert!(AmqpError::DeclareQueueError("q".into()).is_declare());
        assert!(AmqpError::BindingExchangeToQueueError("e".into(), "q".into(), "x".into()).is_bind());
        assert!(AmqpError::PublishingError("channel closed".into()).is_transport());
        assert!(!AmqpError::ConfigError("x".into()).is_transport());
    }

    #[test]
    fn mismatch_message_names_method_and_kind() {
        let err = AmqpError::TopologyMismatchError {
            method: "publish_topic".into(),
            kind: "direct".into(),
        };
        assert_eq!(
            err.to_string(),
            "`publish_topic` cannot be used on a `direct` exchange"
        );
    }
}
