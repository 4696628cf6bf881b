// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport
//!
//! This module handles dialing the RabbitMQ server. A [`Transport`] produces a
//! live [`Link`] together with its [`LinkEvents`]: a one-shot notification
//! fired when the broker closes the link, and a stream of blocked/unblocked
//! flow-control transitions. [`LapinTransport`] is the lapin-backed
//! implementation, with optional TLS for `amqps://` URLs.

use crate::{
    channel::{AmqpChannel, LapinChannel},
    errors::AmqpError,
};
use async_trait::async_trait;
use lapin::{
    tcp::{OwnedIdentity, OwnedTLSConfig},
    types::LongString,
    uri::{AMQPScheme, AMQPUri},
    Connection, ConnectionProperties,
};
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

/// Reply code sent when the connection is closed on purpose.
const AMQP_REPLY_SUCCESS: u16 = 200;

/// How often the lapin link samples the broker's flow-control state.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Broker-driven notifications of one link.
pub struct LinkEvents {
    /// Fires once with the reason when the broker closes the link.
    /// Dropping the sender without a value also means the link is gone.
    pub closed: oneshot::Receiver<String>,
    /// `true` when the broker blocks the link, `false` when it unblocks it.
    pub blocked: mpsc::UnboundedReceiver<bool>,
}

/// A live transport-level link to the broker.
#[async_trait]
pub trait Link: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Result of a successful dial.
pub struct Dialed {
    pub link: Arc<dyn Link>,
    pub events: LinkEvents,
}

/// Something able to open links to the broker, once per (re)connect.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn dial(&self) -> Result<Dialed, AmqpError>;
}

/// TLS material used for `amqps://` connections.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file with the CA certificate chain trusted for the broker.
    pub(crate) ca_cert_path: Option<String>,
    /// PKCS#12 file holding the client certificate and key.
    pub(crate) identity_path: Option<String>,
    pub(crate) identity_password: String,
}

impl TlsConfig {
    /// Empty configuration: the platform's trusted roots, no client identity.
    pub fn new() -> Self {
        Self::default()
    }

    /// PEM file with the CA chain trusted for the broker.
    pub fn ca_cert(mut self, path: &str) -> Self {
        self.ca_cert_path = Some(path.to_owned());
        self
    }

    /// PKCS#12 client identity and its password.
    pub fn identity(mut self, path: &str, password: &str) -> Self {
        self.identity_path = Some(path.to_owned());
        self.identity_password = password.to_owned();
        self
    }

    fn load(&self) -> Result<TlsMaterial, AmqpError> {
        let cert_chain = self
            .ca_cert_path
            .as_ref()
            .map(|path| {
                std::fs::read_to_string(path).map_err(|err| {
                    AmqpError::ConfigError(format!("failure to read ca certificate `{path}`: {err}"))
                })
            })
            .transpose()?;

        let identity = self
            .identity_path
            .as_ref()
            .map(|path| {
                std::fs::read(path).map_err(|err| {
                    AmqpError::ConfigError(format!("failure to read client identity `{path}`: {err}"))
                })
            })
            .transpose()?;

        Ok(TlsMaterial {
            cert_chain,
            identity,
            password: self.identity_password.clone(),
        })
    }
}

struct TlsMaterial {
    cert_chain: Option<String>,
    identity: Option<Vec<u8>>,
    password: String,
}

impl TlsMaterial {
    fn owned(&self) -> OwnedTLSConfig {
        OwnedTLSConfig {
            identity: self.identity.as_ref().map(|der| OwnedIdentity {
                der: der.clone(),
                password: self.password.clone(),
            }),
            cert_chain: self.cert_chain.clone(),
        }
    }
}

/// Checks the broker URL and the TLS requirement of its scheme.
pub(crate) fn validate_url(url: &str, tls: Option<&TlsConfig>) -> Result<AMQPUri, AmqpError> {
    if url.is_empty() {
        return Err(AmqpError::ConfigError("broker url is empty".to_owned()));
    }

    let uri: AMQPUri = url
        .parse()
        .map_err(|err| AmqpError::ConfigError(format!("invalid broker url: {err}")))?;

    if matches!(uri.scheme, AMQPScheme::AMQPS) && tls.is_none() {
        return Err(AmqpError::ConfigError(
            "amqps:// requires a tls configuration".to_owned(),
        ));
    }

    Ok(uri)
}

/// [`Transport`] dialing the broker with lapin.
pub struct LapinTransport {
    url: String,
    connection_name: Option<String>,
    tls: Option<TlsMaterial>,
}

impl LapinTransport {
    /// Validates `url` against `tls` and loads the TLS material.
    ///
    /// # Returns
    /// `ConfigError` for an empty or invalid URL, an `amqps://` URL without
    /// TLS configuration, or unreadable TLS files.
    pub fn new(
        url: &str,
        tls: Option<&TlsConfig>,
        connection_name: Option<&str>,
    ) -> Result<Self, AmqpError> {
        validate_url(url, tls)?;

        Ok(LapinTransport {
            url: url.to_owned(),
            connection_name: connection_name.map(str::to_owned),
            tls: tls.map(TlsConfig::load).transpose()?,
        })
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(LongString::from(name.as_str())),
            None => properties,
        }
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn dial(&self) -> Result<Dialed, AmqpError> {
        debug!("creating amqp connection...");

        let connection = match &self.tls {
            None => Connection::connect(&self.url, self.properties()).await,
            Some(tls) => {
                Connection::connect_with_config(&self.url, self.properties(), tls.owned()).await
            }
        }
        .map_err(|err| {
            error!(error = err.to_string(), "failure to connect");
            AmqpError::ConnectionError(err.to_string())
        })?;

        let (closed_tx, closed) = oneshot::channel();
        let closed_tx = Mutex::new(Some(closed_tx));
        connection.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection broken");
            let sender = closed_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(err.to_string());
            }
        });

        let (blocked_tx, blocked) = mpsc::unbounded_channel();
        let link = Arc::new(LapinLink { connection });
        tokio::spawn(watch_blocked(Arc::downgrade(&link), blocked_tx));

        debug!("amqp connected");

        Ok(Dialed {
            link,
            events: LinkEvents { closed, blocked },
        })
    }
}

/// Reports flow-control transitions of a lapin link until it goes away.
async fn watch_blocked(link: Weak<LapinLink>, blocked: mpsc::UnboundedSender<bool>) {
    let mut was_blocked = false;

    loop {
        tokio::time::sleep(BLOCKED_POLL_INTERVAL).await;

        let Some(link) = link.upgrade() else {
            return;
        };
        let status = link.connection.status();
        if !status.connected() {
            return;
        }

        let is_blocked = status.blocked();
        if is_blocked != was_blocked {
            was_blocked = is_blocked;
            if blocked.send(is_blocked).is_err() {
                return;
            }
        }
    }
}

struct LapinLink {
    connection: Connection,
}

#[async_trait]
impl Link for LapinLink {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");

        let channel = self.connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        debug!("channel created");
        Ok(Arc::new(LapinChannel::new(channel)))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if !self.connection.status().connected() {
            return Ok(());
        }

        self.connection
            .close(AMQP_REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| AmqpError::ConnectionError(err.to_string()))
    }
}
