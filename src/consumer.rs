// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! A [`Consumer`] is a consuming session bound to one (exchange, queue) pair.
//! Construction only stores configuration; [`Consumer::consume`] spawns the
//! consume loop, which owns the session's channel and re-creates it whenever
//! the subscription breaks:
//!
//! 1. wait until the connection reports connectivity,
//! 2. open a channel, declare the topology and apply QoS,
//! 3. subscribe to the queue,
//! 4. hand every delivery to the [`MessageHandler`] in order, acking on
//!    success unless `auto_ack` is set.
//!
//! Any failure in steps 2-3, or the delivery stream closing, sends the loop
//! back to step 1. The loop terminates when the connection is closed or the
//! consumer itself is closed. Handler errors and panics never end the loop.

use crate::{
    channel::{AmqpChannel, Delivery, DeliveryStream},
    connection::{wait_exit, Connection},
    errors::{AmqpError, HandlerError},
    exchange::Exchange,
    otel,
    queue::{BindOptions, DeadLetterOptions, ExchangeOptions, QueueOptions, TopologyOptions},
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable, ShortString},
};
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
    Context,
};
use serde::Deserialize;
use std::{
    any::Any,
    borrow::Cow,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Consumer priority argument of `basic.consume`.
pub const AMQP_HEADERS_PRIORITY: &str = "x-priority";

const DEFAULT_FIRST_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-consumer flow control. No `basic.qos` is sent unless enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QosOptions {
    pub(crate) enabled: bool,
    pub(crate) prefetch_count: u16,
    pub(crate) prefetch_size: u32,
    pub(crate) global: bool,
}

impl QosOptions {
    /// Enables QoS with `count` unacknowledged messages in flight.
    pub fn prefetch(count: u16) -> Self {
        QosOptions {
            enabled: true,
            prefetch_count: count,
            ..Default::default()
        }
    }

    /// Prefetch window in bytes. RabbitMQ rejects non-zero values, so the
    /// lapin channel logs and ignores it.
    pub fn prefetch_size(mut self, size: u32) -> Self {
        self.prefetch_size = size;
        self
    }

    /// Applies the limit to the whole channel instead of this consumer.
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }
}

/// Options of the `basic.consume` subscription.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsumeOptions {
    pub(crate) consumer_tag: String,
    pub(crate) exclusive: bool,
    pub(crate) no_local: bool,
    pub(crate) no_wait: bool,
    pub(crate) priority: Option<i32>,
    #[serde(skip)]
    pub(crate) arguments: FieldTable,
}

impl ConsumeOptions {
    /// Consumer tag; a random one is generated when left empty.
    pub fn consumer_tag(mut self, tag: &str) -> Self {
        self.consumer_tag = tag.to_owned();
        self
    }

    /// Requests exclusive access to the queue.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Skips messages published on the same connection.
    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    /// Does not wait for the broker's `consume-ok`.
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Consumer priority, sent as `x-priority`.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Extra `basic.consume` argument.
    pub fn argument(mut self, key: &str, value: AMQPValue) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    fn basic_consume_options(&self, auto_ack: bool) -> BasicConsumeOptions {
        BasicConsumeOptions {
            no_local: self.no_local,
            no_ack: auto_ack,
            exclusive: self.exclusive,
            nowait: self.no_wait,
        }
    }

    fn consume_arguments(&self) -> FieldTable {
        let mut arguments = self.arguments.inner().clone();
        if let Some(priority) = self.priority {
            arguments.insert(
                ShortString::from(AMQP_HEADERS_PRIORITY),
                AMQPValue::LongInt(priority),
            );
        }
        FieldTable::from(arguments)
    }
}

/// What happens to a message whose handler failed or panicked.
///
/// Only relevant when `auto_ack` is off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerErrorPolicy {
    /// Leave the message unacknowledged; the broker redelivers it once the
    /// channel is recovered.
    #[default]
    LeaveUnacked,
    /// Send a `basic.nack`; without requeue the message is dead-lettered
    /// when the queue has a dead-letter exchange.
    Reject { requeue: bool },
}

/// Construction options of a [`Consumer`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerOptions {
    pub(crate) topology: TopologyOptions,
    pub(crate) auto_ack: bool,
    pub(crate) qos: QosOptions,
    pub(crate) consume: ConsumeOptions,
    pub(crate) on_handler_error: HandlerErrorPolicy,
    pub(crate) first_poll_interval: Duration,
    pub(crate) poll_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            topology: TopologyOptions::default(),
            auto_ack: false,
            qos: QosOptions::default(),
            consume: ConsumeOptions::default(),
            on_handler_error: HandlerErrorPolicy::default(),
            first_poll_interval: DEFAULT_FIRST_POLL_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ConsumerOptions {
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

    /// Enables dead-lettering for the consumed queue.
    pub fn dead_letter(mut self, options: DeadLetterOptions) -> Self {
        self.topology.dead_letter = Some(options);
        self
    }

    /// Lets the broker consider messages acknowledged on delivery.
    /// Handler failures then lose the message.
    pub fn auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// QoS applied on every (re)initialization.
    pub fn qos(mut self, qos: QosOptions) -> Self {
        self.qos = qos;
        self
    }

    /// `basic.consume` options.
    pub fn consume(mut self, consume: ConsumeOptions) -> Self {
        self.consume = consume;
        self
    }

    /// Policy applied when the handler fails or panics.
    pub fn on_handler_error(mut self, policy: HandlerErrorPolicy) -> Self {
        self.on_handler_error = policy;
        self
    }

    /// Delay before the first connectivity check of the consume loop.
    pub fn first_poll_interval(mut self, interval: Duration) -> Self {
        self.first_poll_interval = interval;
        self
    }

    /// Delay between connectivity checks after a failure.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Processes the body of one delivered message.
///
/// `ctx` is the trace context extracted from the message headers and
/// `trace_id` identifies the delivery as `exchange/queue/delivery-tag`.
/// Closures `Fn(Context, Vec<u8>, String) -> impl Future` implement it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: Context, body: Vec<u8>, trace_id: String)
        -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Context, Vec<u8>, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: Context,
        body: Vec<u8>,
        trace_id: String,
    ) -> Result<(), HandlerError> {
        (self)(ctx, body, trace_id).await
    }
}

/// A self-healing consuming session bound to one exchange and queue.
pub struct Consumer {
    shared: Arc<Shared>,
}

struct Shared {
    exchange: Exchange,
    queue_name: String,
    consumer_tag: String,
    connection: Connection,
    options: ConsumerOptions,
    channel: Mutex<Option<Arc<dyn AmqpChannel>>>,
    cancel: watch::Sender<bool>,
    running: AtomicBool,
}

/// Clears the running flag when the consume loop ends, unwinding included.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Flow {
    Stop,
    Reinitialize,
}

impl Consumer {
    /// Stores the session configuration. Nothing is declared until
    /// [`Consumer::consume`] is called.
    ///
    /// # Returns
    /// `ConfigError` for an empty `queue_name` or an invalid exchange.
    pub fn new(
        exchange: Exchange,
        queue_name: &str,
        connection: &Connection,
        options: ConsumerOptions,
    ) -> Result<Consumer, AmqpError> {
        exchange.validate()?;
        if queue_name.is_empty() {
            return Err(AmqpError::ConfigError(
                "a consumer requires a queue name".to_owned(),
            ));
        }

        let consumer_tag = if options.consume.consumer_tag.is_empty() {
            format!("{queue_name}-{}", Uuid::new_v4())
        } else {
            options.consume.consumer_tag.clone()
        };

        let (cancel, _) = watch::channel(false);

        Ok(Consumer {
            shared: Arc::new(Shared {
                exchange,
                queue_name: queue_name.to_owned(),
                consumer_tag,
                connection: connection.clone(),
                options,
                channel: Mutex::new(None),
                cancel,
                running: AtomicBool::new(false),
            }),
        })
    }

    /// The exchange the queue is bound to.
    pub fn exchange(&self) -> &Exchange {
        &self.shared.exchange
    }

    /// The consumed queue.
    pub fn queue_name(&self) -> &str {
        &self.shared.queue_name
    }

    /// Tag sent with `basic.consume`, generated when not configured.
    pub fn consumer_tag(&self) -> &str {
        &self.shared.consumer_tag
    }

    /// Spawns the consume loop and returns immediately.
    ///
    /// Fails with `ConsumerError` if the loop is already running or the
    /// consumer was closed.
    pub fn consume<H>(&self, handler: H) -> Result<JoinHandle<()>, AmqpError>
    where
        H: MessageHandler + 'static,
    {
        if *self.shared.cancel.borrow() {
            return Err(AmqpError::ConsumerError("consumer is closed".to_owned()));
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::ConsumerError(
                "consumer is already running".to_owned(),
            ));
        }

        let shared = Arc::clone(&self.shared);
        let handler: Arc<dyn MessageHandler> = Arc::new(handler);

        Ok(tokio::spawn(async move {
            let _running = RunningGuard(&shared.running);
            shared.run(handler).await;
        }))
    }

    /// Stops the consume loop and closes the current channel.
    pub async fn close(&self) {
        let first = self.shared.cancel.send_if_modified(|closed| {
            if *closed {
                return false;
            }
            *closed = true;
            true
        });

        if first {
            info!(queue = self.shared.queue_name.as_str(), "closing consumer");
        }

        self.shared.release_channel().await;
    }
}

impl Shared {
    fn lock_channel(&self) -> MutexGuard<'_, Option<Arc<dyn AmqpChannel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn install_channel(&self, channel: Arc<dyn AmqpChannel>) -> Option<Arc<dyn AmqpChannel>> {
        self.lock_channel().replace(channel)
    }

    async fn release_channel(&self) {
        let channel = self.lock_channel().take();
        if let Some(channel) = channel {
            close_channel(channel.as_ref()).await;
        }
    }

    #[tracing::instrument(
        name = "consume_loop",
        skip_all,
        fields(exchange = self.exchange.name(), queue = self.queue_name.as_str())
    )]
    async fn run(&self, handler: Arc<dyn MessageHandler>) {
        let mut exit = self.connection.exit_signal();
        let mut cancel = self.cancel.subscribe();
        let tracer = global::tracer("amqp consumer");
        let mut interval = self.options.first_poll_interval;

        loop {
            if !self.wait_connected(&mut exit, &mut cancel, interval).await {
                break;
            }
            interval = self.options.poll_interval;

            let initialized = AssertUnwindSafe(self.initialize())
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(AmqpError::ConsumerError(format!(
                        "initialization panicked: {}",
                        panic_message(panic.as_ref())
                    )))
                });

            let (channel, stream) = match initialized {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(error = err.to_string(), "failure to initialize the consumer, retrying");
                    self.release_channel().await;
                    continue;
                }
            };

            info!(consumer_tag = self.consumer_tag, "consumer subscribed");

            let flow = self
                .deliver(channel.as_ref(), stream, handler.as_ref(), &tracer, &mut exit, &mut cancel)
                .await;

            match flow {
                Flow::Stop => break,
                Flow::Reinitialize => warn!("delivery stream closed, re-initializing the consumer"),
            }
        }

        self.release_channel().await;
        info!("consumer terminated");
    }

    /// Polls the connectivity every `interval`; `false` once the connection
    /// or the consumer is closed.
    async fn wait_connected(
        &self,
        exit: &mut watch::Receiver<bool>,
        cancel: &mut watch::Receiver<bool>,
        interval: Duration,
    ) -> bool {
        let mut interval = interval;

        loop {
            tokio::select! {
                biased;
                _ = wait_exit(exit) => return false,
                _ = wait_exit(cancel) => return false,
                _ = tokio::time::sleep(interval) => {}
            }

            if self.connection.check_connected() {
                return true;
            }

            debug!("waiting for the amqp connection");
            interval = self.options.poll_interval;
        }
    }

    async fn initialize(&self) -> Result<(Arc<dyn AmqpChannel>, DeliveryStream), AmqpError> {
        let channel = self.connection.create_channel().await?;
        if let Some(stale) = self.install_channel(Arc::clone(&channel)) {
            close_channel(stale.as_ref()).await;
        }

        Topology::new(&self.exchange, &self.queue_name, &self.options.topology)
            .install(channel.as_ref())
            .await?;

        let qos = &self.options.qos;
        if qos.enabled {
            channel
                .basic_qos(qos.prefetch_count, qos.prefetch_size, qos.global)
                .await?;
        }

        let consume = &self.options.consume;
        let stream = channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                consume.basic_consume_options(self.options.auto_ack),
                consume.consume_arguments(),
            )
            .await?;

        Ok((channel, stream))
    }

    async fn deliver(
        &self,
        channel: &dyn AmqpChannel,
        mut stream: DeliveryStream,
        handler: &dyn MessageHandler,
        tracer: &BoxedTracer,
        exit: &mut watch::Receiver<bool>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Flow {
        loop {
            let next = tokio::select! {
                biased;
                _ = wait_exit(exit) => return Flow::Stop,
                _ = wait_exit(cancel) => return Flow::Stop,
                next = stream.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let tag = delivery.delivery_tag;
                    let processed = AssertUnwindSafe(self.process(channel, handler, tracer, delivery))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = processed {
                        error!(
                            reason = panic_message(panic.as_ref()),
                            delivery_tag = tag,
                            "panic while processing message"
                        );
                    }
                }
                Some(Err(err)) => {
                    warn!(error = err.to_string(), "delivery stream failed");
                    return Flow::Reinitialize;
                }
                None => return Flow::Reinitialize,
            }
        }
    }

    async fn process(
        &self,
        channel: &dyn AmqpChannel,
        handler: &dyn MessageHandler,
        tracer: &BoxedTracer,
        delivery: Delivery,
    ) {
        let tag = delivery.delivery_tag;
        let trace_id = format!("{}/{}/{}", self.exchange.name(), self.queue_name, tag);
        let (ctx, mut span) = otel::new_span(delivery.headers.as_ref(), tracer, &trace_id);

        debug!(trace_id, redelivered = delivery.redelivered, "message received");

        let outcome = AssertUnwindSafe(handler.handle(ctx, delivery.data, trace_id.clone()))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => {
                error!(error = err.to_string(), trace_id, "failure to handle message");
                Some(err.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!(reason, trace_id, "message handler panicked");
                Some(format!("handler panicked: {reason}"))
            }
        };

        let Some(reason) = failure else {
            span.set_status(Status::Ok);
            if !self.options.auto_ack {
                if let Err(err) = channel.basic_ack(tag).await {
                    error!(error = err.to_string(), trace_id, "failure to ack message");
                    span.record_error(&err);
                }
            }
            return;
        };

        span.set_status(Status::Error {
            description: Cow::from(reason),
        });

        if self.options.auto_ack {
            return;
        }

        if let HandlerErrorPolicy::Reject { requeue } = self.options.on_handler_error {
            if let Err(err) = channel.basic_nack(tag, requeue).await {
                error!(error = err.to_string(), trace_id, "failure to nack message");
                span.record_error(&err);
            }
        }
    }
}

async fn close_channel(channel: &dyn AmqpChannel) {
    if let Err(err) = channel.close().await {
        debug!(error = err.to_string(), "failure to close the consumer channel");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return (*message).to_owned();
    }
    panic
        .downcast_ref::<String>()
        .cloned()
        .unwrap_or_else(|| "unknown panic".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::ConnectionOptions,
        exchange::{HeaderMatch, Routing},
        testing::{delivery, eventually, Call, FakeTransport, Recorder},
    };
    use std::collections::HashSet;

    type Seen = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    async fn connect(recorder: &Arc<Recorder>) -> (Arc<FakeTransport>, Connection) {
        let transport = FakeTransport::with_channels(recorder.factory());
        let connection = Connection::with_transport(
            transport.clone(),
            ConnectionOptions::default().reconnect_interval(Duration::from_millis(10)),
        )
        .await
        .unwrap();
        (transport, connection)
    }

    fn options() -> ConsumerOptions {
        ConsumerOptions::default()
            .first_poll_interval(Duration::from_millis(1))
            .poll_interval(Duration::from_millis(5))
    }

    fn recording(seen: &Seen) -> impl MessageHandler {
        let seen = Arc::clone(seen);
        move |_ctx: Context, body: Vec<u8>, trace_id: String| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().unwrap().push((trace_id, body));
                Ok::<(), HandlerError>(())
            }
        }
    }

    /// Fails every body listed in `failing` the first time it is seen.
    struct FlakyHandler {
        seen: Seen,
        failing: Mutex<HashSet<Vec<u8>>>,
    }

    #[async_trait]
    impl MessageHandler for FlakyHandler {
        async fn handle(
            &self,
            _ctx: Context,
            body: Vec<u8>,
            trace_id: String,
        ) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push((trace_id, body.clone()));
            if self.failing.lock().unwrap().remove(&body) {
                return Err("temporary failure".into());
            }
            Ok(())
        }
    }

    fn flaky(seen: &Seen, failing: &[&[u8]]) -> FlakyHandler {
        FlakyHandler {
            seen: Arc::clone(seen),
            failing: Mutex::new(failing.iter().map(|body| body.to_vec()).collect()),
        }
    }

    fn acks(recorder: &Recorder, tag: u64) -> usize {
        recorder.count(|c| matches!(c, Call::Ack(t) if *t == tag))
    }

    #[tokio::test]
    async fn new_validates_configuration_without_io() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;

        let err = Consumer::new(Exchange::fanout("broadcast"), "", &connection, options())
            .err()
            .unwrap();
        assert!(err.is_config());

        let err = Consumer::new(
            Exchange::headers("", HeaderMatch::all().header("k", "v")),
            "work",
            &connection,
            options(),
        )
        .err()
        .unwrap();
        assert!(err.is_config());

        let consumer =
            Consumer::new(Exchange::direct("orders", "created"), "work", &connection, options())
                .unwrap();
        assert!(consumer.consumer_tag().starts_with("work-"));
        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn initializes_topology_and_acks_handled_messages() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let deliveries = recorder.deliveries();
        let seen = Seen::default();

        let consumer = Consumer::new(
            Exchange::direct("orders", "created"),
            "work",
            &connection,
            options().qos(QosOptions::prefetch(10)),
        )
        .unwrap();
        consumer.consume(recording(&seen)).unwrap();

        deliveries.send(Ok(delivery(7, b"first"))).unwrap();
        deliveries.send(Ok(delivery(8, b"second"))).unwrap();
        assert!(eventually(|| acks(&recorder, 8) == 1).await);

        assert_eq!(recorder.count(|c| matches!(c, Call::ExchangeDeclare { .. })), 1);
        assert_eq!(recorder.count(|c| matches!(c, Call::QueueDeclare { .. })), 1);
        assert_eq!(recorder.count(|c| matches!(c, Call::Bind { .. })), 1);
        assert_eq!(
            recorder.count(|c| matches!(
                c,
                Call::Qos {
                    prefetch_count: 10,
                    prefetch_size: 0,
                    global: false
                }
            )),
            1
        );
        assert_eq!(
            recorder.count(|c| matches!(c, Call::Consume { queue, no_ack: false } if queue == "work")),
            1
        );
        assert_eq!(acks(&recorder, 7), 1);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("orders/work/7".to_owned(), b"first".to_vec()),
                ("orders/work/8".to_owned(), b"second".to_vec()),
            ]
        );

        connection.close();
    }

    #[tokio::test]
    async fn qos_is_not_sent_unless_enabled() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let consumer =
            Consumer::new(Exchange::fanout("broadcast"), "inbox", &connection, options()).unwrap();
        consumer.consume(recording(&Seen::default())).unwrap();

        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 1).await);
        assert_eq!(recorder.count(|c| matches!(c, Call::Qos { .. })), 0);
        connection.close();
    }

    #[tokio::test]
    async fn waits_for_connectivity_before_initializing() {
        let recorder = Recorder::new();
        let (transport, connection) = connect(&recorder).await;
        transport.fail_dials(usize::MAX);
        transport.drop_link();
        assert!(eventually(|| !connection.check_connected()).await);

        let consumer = Consumer::new(
            Exchange::topic("events", "orders.*"),
            "orders",
            &connection,
            options(),
        )
        .unwrap();
        consumer.consume(recording(&Seen::default())).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(recorder.calls().is_empty());

        transport.fail_dials(0);
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 1).await);
        connection.close();
    }

    #[tokio::test]
    async fn initialization_failures_are_retried() {
        let recorder = Recorder::new();
        recorder.fail("queue_declare");
        let (_, connection) = connect(&recorder).await;

        let consumer =
            Consumer::new(Exchange::direct("orders", "created"), "work", &connection, options())
                .unwrap();
        consumer.consume(recording(&Seen::default())).unwrap();

        assert!(eventually(|| recorder.count(|c| matches!(c, Call::QueueDeclare { .. })) >= 2).await);
        assert!(recorder.count(|c| matches!(c, Call::Close)) >= 1);
        assert_eq!(recorder.count(|c| matches!(c, Call::Consume { .. })), 0);

        recorder.succeed("queue_declare");
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 1).await);
        connection.close();
    }

    #[tokio::test]
    async fn self_heals_after_connection_loss() {
        let recorder = Recorder::new();
        let (transport, connection) = connect(&recorder).await;
        let before = recorder.deliveries();
        let after = recorder.deliveries();
        let seen = Seen::default();

        let consumer = Consumer::new(
            Exchange::delayed("later", Routing::Fanout),
            "jobs",
            &connection,
            options(),
        )
        .unwrap();
        consumer.consume(recording(&seen)).unwrap();

        before.send(Ok(delivery(1, b"before"))).unwrap();
        assert!(eventually(|| acks(&recorder, 1) == 1).await);

        transport.drop_link();
        drop(before);

        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 2).await);
        assert_eq!(transport.dials(), 2);
        assert_eq!(recorder.count(|c| matches!(c, Call::ExchangeDeclare { .. })), 2);

        after.send(Ok(delivery(1, b"after"))).unwrap();
        assert!(eventually(|| acks(&recorder, 1) == 2).await);
        assert_eq!(seen.lock().unwrap().len(), 2);
        connection.close();
    }

    #[tokio::test]
    async fn failed_message_stays_unacked_until_redelivered() {
        let recorder = Recorder::new();
        let (transport, connection) = connect(&recorder).await;
        let first = recorder.deliveries();
        let second = recorder.deliveries();
        let seen = Seen::default();

        let consumer =
            Consumer::new(Exchange::direct("orders", "created"), "work", &connection, options())
                .unwrap();
        consumer.consume(flaky(&seen, &[b"order"])).unwrap();

        first.send(Ok(delivery(1, b"order"))).unwrap();
        first.send(Ok(delivery(2, b"other"))).unwrap();
        assert!(eventually(|| acks(&recorder, 2) == 1).await);
        assert_eq!(acks(&recorder, 1), 0);
        assert_eq!(recorder.count(|c| matches!(c, Call::Nack(..))), 0);

        transport.drop_link();
        drop(first);

        let mut redelivery = delivery(1, b"order");
        redelivery.redelivered = true;
        second.send(Ok(redelivery)).unwrap();

        assert!(eventually(|| acks(&recorder, 1) == 1).await);
        assert_eq!(seen.lock().unwrap().len(), 3);
        connection.close();
    }

    #[tokio::test]
    async fn reject_policy_nacks_failed_messages() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let deliveries = recorder.deliveries();
        let seen = Seen::default();

        let consumer = Consumer::new(
            Exchange::direct("orders", "created"),
            "work",
            &connection,
            options().on_handler_error(HandlerErrorPolicy::Reject { requeue: false }),
        )
        .unwrap();
        consumer.consume(flaky(&seen, &[b"bad"])).unwrap();

        deliveries.send(Ok(delivery(3, b"bad"))).unwrap();
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Nack(3, false))) == 1).await);
        assert_eq!(acks(&recorder, 3), 0);
        connection.close();
    }

    #[tokio::test]
    async fn auto_ack_skips_explicit_acknowledgements() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let deliveries = recorder.deliveries();
        let seen = Seen::default();

        let consumer = Consumer::new(
            Exchange::fanout("broadcast"),
            "inbox",
            &connection,
            options().auto_ack(true),
        )
        .unwrap();
        consumer.consume(recording(&seen)).unwrap();

        deliveries.send(Ok(delivery(1, b"m"))).unwrap();
        assert!(eventually(|| seen.lock().unwrap().len() == 1).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(recorder.count(|c| matches!(c, Call::Consume { no_ack: true, .. })), 1);
        assert_eq!(recorder.count(|c| matches!(c, Call::Ack(_))), 0);
        connection.close();
    }

    #[tokio::test]
    async fn handler_panic_does_not_end_consumption() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let deliveries = recorder.deliveries();
        let seen = Seen::default();

        let recorded = Arc::clone(&seen);
        let handler = move |_ctx: Context, body: Vec<u8>, trace_id: String| {
            let seen = Arc::clone(&recorded);
            async move {
                if body == b"boom" {
                    panic!("malformed message");
                }
                seen.lock().unwrap().push((trace_id, body));
                Ok::<(), HandlerError>(())
            }
        };

        let consumer =
            Consumer::new(Exchange::direct("orders", "created"), "work", &connection, options())
                .unwrap();
        let handle = consumer.consume(handler).unwrap();

        deliveries.send(Ok(delivery(1, b"boom"))).unwrap();
        deliveries.send(Ok(delivery(2, b"fine"))).unwrap();

        assert!(eventually(|| acks(&recorder, 2) == 1).await);
        assert_eq!(acks(&recorder, 1), 0);
        assert!(!handle.is_finished());
        assert_eq!(recorder.count(|c| matches!(c, Call::Consume { .. })), 1);
        connection.close();
    }

    #[tokio::test]
    async fn panic_while_acking_does_not_end_consumption() {
        let recorder = Recorder::new();
        recorder.panic_on("basic_ack");
        let (_, connection) = connect(&recorder).await;
        let deliveries = recorder.deliveries();
        let seen = Seen::default();

        let consumer =
            Consumer::new(Exchange::direct("orders", "created"), "work", &connection, options())
                .unwrap();
        let handle = consumer.consume(recording(&seen)).unwrap();

        deliveries.send(Ok(delivery(1, b"first"))).unwrap();
        deliveries.send(Ok(delivery(2, b"second"))).unwrap();
        assert!(eventually(|| seen.lock().unwrap().len() == 2).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(acks(&recorder, 1), 1);
        assert!(!handle.is_finished());
        assert_eq!(recorder.count(|c| matches!(c, Call::Consume { .. })), 1);

        let err = consumer.consume(recording(&seen)).unwrap_err();
        assert_eq!(
            err,
            AmqpError::ConsumerError("consumer is already running".into())
        );
        connection.close();
    }

    #[tokio::test]
    async fn panic_during_initialization_is_retried() {
        let recorder = Recorder::new();
        recorder.panic_on("exchange_declare");
        let (_, connection) = connect(&recorder).await;

        let consumer =
            Consumer::new(Exchange::fanout("broadcast"), "inbox", &connection, options()).unwrap();
        let handle = consumer.consume(recording(&Seen::default())).unwrap();

        assert!(eventually(|| recorder.count(|c| matches!(c, Call::ExchangeDeclare { .. })) >= 2).await);
        assert!(!handle.is_finished());

        recorder.succeed("exchange_declare");
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 1).await);
        connection.close();
    }

    #[tokio::test]
    async fn connection_close_ends_a_loop_waiting_for_connectivity() {
        let recorder = Recorder::new();
        let (transport, connection) = connect(&recorder).await;
        transport.fail_dials(usize::MAX);
        transport.drop_link();
        assert!(eventually(|| !connection.check_connected()).await);

        let consumer =
            Consumer::new(Exchange::fanout("broadcast"), "inbox", &connection, options()).unwrap();
        let handle = consumer.consume(recording(&Seen::default())).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        connection.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(recorder.calls().is_empty());

        let err = consumer.consume(recording(&Seen::default())).err();
        assert!(err.is_none());
    }

    #[tokio::test]
    async fn connection_close_ends_a_loop_retrying_initialization() {
        let recorder = Recorder::new();
        recorder.fail("queue_bind");
        let (_, connection) = connect(&recorder).await;

        let consumer = Consumer::new(
            Exchange::topic("events", "orders.*"),
            "orders",
            &connection,
            options(),
        )
        .unwrap();
        let handle = consumer.consume(recording(&Seen::default())).unwrap();
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Bind { .. })) >= 2).await);

        connection.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorder.count(|c| matches!(c, Call::Consume { .. })), 0);
    }

    #[tokio::test]
    async fn connection_close_terminates_every_consumer() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;

        let first = Consumer::new(Exchange::fanout("broadcast"), "a", &connection, options())
            .unwrap()
            .consume(recording(&Seen::default()))
            .unwrap();
        let second = Consumer::new(Exchange::fanout("broadcast"), "b", &connection, options())
            .unwrap()
            .consume(recording(&Seen::default()))
            .unwrap();
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 2).await);

        connection.close();
        connection.close();

        tokio::time::timeout(Duration::from_secs(1), first)
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(recorder.count(|c| matches!(c, Call::Close)), 2);
    }

    #[tokio::test]
    async fn consumer_close_stops_only_that_consumer() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;

        let closing = Consumer::new(Exchange::fanout("broadcast"), "a", &connection, options())
            .unwrap();
        let staying = Consumer::new(Exchange::fanout("broadcast"), "b", &connection, options())
            .unwrap();
        let closing_loop = closing.consume(recording(&Seen::default())).unwrap();
        let staying_loop = staying.consume(recording(&Seen::default())).unwrap();
        assert!(eventually(|| recorder.count(|c| matches!(c, Call::Consume { .. })) == 2).await);

        closing.close().await;
        closing.close().await;
        tokio::time::timeout(Duration::from_secs(1), closing_loop)
            .await
            .unwrap()
            .unwrap();

        assert!(connection.check_connected());
        assert!(!staying_loop.is_finished());
        assert_eq!(recorder.count(|c| matches!(c, Call::Close)), 1);

        let err = closing.consume(recording(&Seen::default())).unwrap_err();
        assert!(matches!(err, AmqpError::ConsumerError(_)));
        connection.close();
    }

    #[tokio::test]
    async fn second_consume_is_rejected_while_running() {
        let recorder = Recorder::new();
        let (_, connection) = connect(&recorder).await;
        let consumer =
            Consumer::new(Exchange::fanout("broadcast"), "inbox", &connection, options()).unwrap();

        consumer.consume(recording(&Seen::default())).unwrap();
        let err = consumer.consume(recording(&Seen::default())).unwrap_err();
        assert_eq!(
            err,
            AmqpError::ConsumerError("consumer is already running".into())
        );
        connection.close();
    }

    #[test]
    fn consume_arguments_carry_priority() {
        let options = ConsumeOptions::default()
            .priority(5)
            .argument("x-cancel-on-ha-failover", AMQPValue::Boolean(true));
        let arguments = options.consume_arguments();

        assert_eq!(
            arguments.inner().get(&ShortString::from(AMQP_HEADERS_PRIORITY)),
            Some(&AMQPValue::LongInt(5))
        );
        assert_eq!(arguments.inner().len(), 2);

        let basic = options.exclusive().basic_consume_options(true);
        assert!(basic.exclusive);
        assert!(basic.no_ack);
    }

    #[test]
    fn options_deserialize() {
        let options: ConsumerOptions = serde_json::from_str(
            r#"{
                "auto_ack": true,
                "qos": { "enabled": true, "prefetch_count": 5 },
                "consume": { "consumer_tag": "billing", "priority": 2 },
                "on_handler_error": { "reject": { "requeue": true } }
            }"#,
        )
        .unwrap();

        assert!(options.auto_ack);
        assert_eq!(options.qos, QosOptions::prefetch(5));
        assert_eq!(options.consume.consumer_tag, "billing");
        assert_eq!(options.consume.priority, Some(2));
        assert_eq!(
            options.on_handler_error,
            HandlerErrorPolicy::Reject { requeue: true }
        );
        assert_eq!(options.poll_interval, DEFAULT_POLL_INTERVAL);
    }
}
