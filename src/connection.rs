// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resilient Broker Connection
//!
//! [`Connection`] owns the single transport link to the broker and a
//! background monitor task that keeps it alive:
//!
//! - `Connected`: waits on the exit signal, the link's close notification and
//!   its blocked/unblocked notifications. Blocked links stay connected.
//! - `Disconnected`: entered when the broker closes the link. The monitor
//!   sleeps `reconnect_interval` and dials again, forever, until a dial
//!   succeeds; the new link is installed and its notifications re-subscribed.
//! - `Closed`: entered once [`Connection::close`] fires the exit signal. The
//!   exit signal is checked before every other event and every reconnect
//!   attempt; the monitor closes the link and terminates.
//!
//! The link handle and the connectivity flag live behind one mutex which is
//! never held across an await point.

use crate::{
    channel::AmqpChannel,
    errors::AmqpError,
    transport::{Dialed, LapinTransport, Link, LinkEvents, TlsConfig, Transport},
};
use serde::Deserialize;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default delay between two reconnect attempts.
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

/// Construction parameters of a [`Connection`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionOptions {
    pub(crate) reconnect_interval: Duration,
    pub(crate) tls: Option<TlsConfig>,
    pub(crate) connection_name: Option<String>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            tls: None,
            connection_name: None,
        }
    }
}

impl ConnectionOptions {
    /// Delay between two reconnect attempts, 5 seconds by default.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// TLS material, mandatory for `amqps://` URLs.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Connection name advertised to the broker.
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_owned());
        self
    }
}

/// A shared, self-healing connection to the broker.
///
/// Cloning is cheap; every clone refers to the same link and monitor.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    reconnect_interval: Duration,
    transport: Arc<dyn Transport>,
    state: Mutex<LinkState>,
    exit: watch::Sender<bool>,
    terminated: watch::Sender<bool>,
}

struct LinkState {
    link: Arc<dyn Link>,
    connected: bool,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection {
    /// Connects to the broker at `url`.
    ///
    /// Fails with a `ConfigError` for an empty/invalid URL or an `amqps://`
    /// URL without TLS configuration. The initial dial is attempted once and
    /// its error returned as is.
    #[tracing::instrument(name = "amqp_connect", skip(url, options))]
    pub async fn new(url: &str, options: ConnectionOptions) -> Result<Connection, AmqpError> {
        let transport = LapinTransport::new(
            url,
            options.tls.as_ref(),
            options.connection_name.as_deref(),
        )?;

        Self::with_transport(Arc::new(transport), options).await
    }

    /// Connects through a custom [`Transport`].
    pub async fn with_transport(
        transport: Arc<dyn Transport>,
        options: ConnectionOptions,
    ) -> Result<Connection, AmqpError> {
        let Dialed { link, events } = transport.dial().await?;

        let (exit, _) = watch::channel(false);
        let (terminated, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            reconnect_interval: options.reconnect_interval,
            transport,
            state: Mutex::new(LinkState {
                link,
                connected: true,
            }),
            exit,
            terminated,
        });

        tokio::spawn(monitor(Arc::clone(&inner), events));
        info!("amqp connection established");

        Ok(Connection { inner })
    }

    /// Snapshot of the current connectivity. Never blocks on I/O.
    pub fn check_connected(&self) -> bool {
        self.inner.lock_state().connected
    }

    /// Whether [`Connection::close`] has been called.
    pub fn is_closed(&self) -> bool {
        *self.inner.exit.borrow()
    }

    /// Marks the connection disconnected and signals the monitor to close the
    /// link. Only the first call has an effect.
    pub fn close(&self) {
        let first = self.inner.exit.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            *closed = true;
            true
        });

        if !first {
            debug!("amqp connection already closed");
            return;
        }

        self.inner.lock_state().connected = false;
        info!("closing amqp connection");
    }

    /// Resolves once the monitor has closed the link and terminated.
    pub async fn terminated(&self) {
        let mut terminated = self.inner.terminated.subscribe();
        let _ = terminated.wait_for(|done| *done).await;
    }

    /// Opens a fresh channel on the current link.
    ///
    /// Fails while the connection is disconnected or closed.
    pub async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let link = {
            let state = self.inner.lock_state();
            if !state.connected {
                return Err(AmqpError::ConnectionError(
                    "connection is not open".to_owned(),
                ));
            }
            Arc::clone(&state.link)
        };

        link.create_channel().await
    }

    pub(crate) fn exit_signal(&self) -> watch::Receiver<bool> {
        self.inner.exit.subscribe()
    }
}

/// Resolves once the exit signal fired (or its sender is gone).
pub(crate) async fn wait_exit(exit: &mut watch::Receiver<bool>) {
    let _ = exit.wait_for(|closed| *closed).await;
}

async fn monitor(inner: Arc<Inner>, mut events: LinkEvents) {
    let mut exit = inner.exit.subscribe();

    loop {
        tokio::select! {
            biased;

            _ = wait_exit(&mut exit) => break,

            reason = &mut events.closed => {
                let reason = reason.unwrap_or_else(|_| "link dropped".to_owned());
                warn!(reason, "amqp connection lost");
                inner.lock_state().connected = false;

                match reconnect(&inner, &mut exit).await {
                    Some(next) => events = next,
                    None => break,
                }
            }

            Some(blocked) = events.blocked.recv() => {
                if blocked {
                    warn!("amqp connection blocked by the broker");
                } else {
                    info!("amqp connection unblocked");
                }
            }
        }
    }

    let link = Arc::clone(&inner.lock_state().link);
    if let Err(err) = link.close().await {
        error!(error = err.to_string(), "failure to close the amqp connection");
    }

    inner.terminated.send_replace(true);
    info!("amqp connection closed");
}

/// Dials until a link is installed; `None` once the exit signal fired.
async fn reconnect(inner: &Inner, exit: &mut watch::Receiver<bool>) -> Option<LinkEvents> {
    let mut attempt: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = wait_exit(exit) => return None,
            _ = tokio::time::sleep(inner.reconnect_interval) => {}
        }

        attempt += 1;
        debug!(attempt, "reconnecting to amqp");

        let Dialed { link, events } = match inner.transport.dial().await {
            Ok(dialed) => dialed,
            Err(err) => {
                error!(error = err.to_string(), attempt, "failure to reconnect");
                continue;
            }
        };

        let installed = {
            let mut state = inner.lock_state();
            let closing = *exit.borrow();
            if !closing {
                state.link = Arc::clone(&link);
                state.connected = true;
            }
            !closing
        };

        if installed {
            info!(attempt, "amqp connection re-established");
            return Some(events);
        }

        if let Err(err) = link.close().await {
            error!(error = err.to_string(), "failure to close the amqp connection");
        }
        return None;
    }
}
