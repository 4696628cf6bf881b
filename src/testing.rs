// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory transport used by the unit tests.

use crate::{
    channel::{AmqpChannel, Delivery, DeliveryStream, MockAmqpChannel},
    errors::AmqpError,
    exchange::ExchangeKind,
    transport::{Dialed, Link, LinkEvents, Transport},
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use lapin::{types::FieldTable, BasicProperties};
use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};

pub(crate) type ChannelFactory = Arc<dyn Fn() -> Arc<dyn AmqpChannel> + Send + Sync>;

/// Polls `condition` for up to two seconds.
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    condition()
}

pub(crate) struct FakeTransport {
    dials: AtomicUsize,
    failures: AtomicUsize,
    closed_links: Arc<AtomicUsize>,
    channels: ChannelFactory,
    current: Mutex<Option<LinkControl>>,
}

struct LinkControl {
    link: Arc<FakeLink>,
    closed: Option<oneshot::Sender<String>>,
    blocked: mpsc::UnboundedSender<bool>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_channels(Arc::new(|| Arc::new(MockAmqpChannel::new()) as Arc<dyn AmqpChannel>))
    }

    pub(crate) fn with_channels(channels: ChannelFactory) -> Arc<Self> {
        Arc::new(FakeTransport {
            dials: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            closed_links: Arc::new(AtomicUsize::new(0)),
            channels,
            current: Mutex::new(None),
        })
    }

    /// The next `count` dials fail.
    pub(crate) fn fail_dials(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub(crate) fn closed_links(&self) -> usize {
        self.closed_links.load(Ordering::SeqCst)
    }

    /// Simulates the broker closing the current link.
    pub(crate) fn drop_link(&self) {
        let mut current = self.current.lock().unwrap();
        if let Some(control) = current.as_mut() {
            control.link.broken.store(true, Ordering::SeqCst);
            if let Some(closed) = control.closed.take() {
                let _ = closed.send("CONNECTION_FORCED".to_owned());
            }
        }
    }

    pub(crate) fn block(&self, blocked: bool) {
        if let Some(control) = self.current.lock().unwrap().as_ref() {
            let _ = control.blocked.send(blocked);
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(&self) -> Result<Dialed, AmqpError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        let link = Arc::new(FakeLink {
            broken: AtomicBool::new(false),
            closed_links: Arc::clone(&self.closed_links),
            channels: Arc::clone(&self.channels),
        });
        let (closed_tx, closed) = oneshot::channel();
        let (blocked_tx, blocked) = mpsc::unbounded_channel();

        *self.current.lock().unwrap() = Some(LinkControl {
            link: Arc::clone(&link),
            closed: Some(closed_tx),
            blocked: blocked_tx,
        });

        Ok(Dialed {
            link,
            events: LinkEvents { closed, blocked },
        })
    }
}

pub(crate) struct FakeLink {
    broken: AtomicBool,
    closed_links: Arc<AtomicUsize>,
    channels: ChannelFactory,
}

#[async_trait]
impl Link for FakeLink {
    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AmqpError::ChannelError("connection not open".to_owned()));
        }
        Ok((self.channels)())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.closed_links.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A broker operation observed on a recording channel.
#[derive(Debug, Clone)]
pub(crate) enum Call {
    ExchangeDeclare {
        name: String,
        kind: ExchangeKind,
        arguments: FieldTable,
    },
    QueueDeclare {
        name: String,
        arguments: FieldTable,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    Qos {
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: BasicProperties,
    },
    Consume {
        queue: String,
        no_ack: bool,
    },
    Ack(u64),
    Nack(u64, bool),
    Close,
}

/// Shared log of calls plus scripted behaviour for recording channels.
#[derive(Default)]
pub(crate) struct Recorder {
    calls: Mutex<Vec<Call>>,
    failing: Mutex<HashSet<&'static str>>,
    panicking: Mutex<HashSet<&'static str>>,
    deliveries: Mutex<VecDeque<mpsc::UnboundedReceiver<Result<Delivery, AmqpError>>>>,
}

impl Recorder {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Recorder::default())
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Makes `operation` (e.g. `"queue_declare"`) fail until `succeed` is called.
    pub(crate) fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub(crate) fn succeed(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
        self.panicking.lock().unwrap().remove(operation);
    }

    /// Makes `operation` panic after recording it, until `succeed` is called.
    pub(crate) fn panic_on(&self, operation: &'static str) {
        self.panicking.lock().unwrap().insert(operation);
    }

    /// Queues the delivery stream handed to the next `basic_consume`.
    pub(crate) fn deliveries(&self) -> mpsc::UnboundedSender<Result<Delivery, AmqpError>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.deliveries.lock().unwrap().push_back(receiver);
        sender
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    fn record(&self, call: Call, operation: &'static str) -> Result<(), AmqpError> {
        self.calls.lock().unwrap().push(call);
        if self.panicking.lock().unwrap().contains(operation) {
            panic!("{operation} panicked");
        }
        if self.failing.lock().unwrap().contains(operation) {
            return Err(failure(operation));
        }
        Ok(())
    }

    /// Channel factory producing recording channels for a [`FakeTransport`].
    pub(crate) fn factory(self: &Arc<Self>) -> ChannelFactory {
        let recorder = Arc::clone(self);
        Arc::new(move || Arc::new(recording_channel(&recorder)) as Arc<dyn AmqpChannel>)
    }
}

fn failure(operation: &'static str) -> AmqpError {
    let reason = format!("{operation} rejected");
    match operation {
        "exchange_declare" => AmqpError::DeclareExchangeError(reason),
        "queue_declare" => AmqpError::DeclareQueueError(reason),
        "queue_bind" => AmqpError::BindingExchangeToQueueError(String::new(), String::new(), reason),
        "basic_qos" => AmqpError::QoSDeclarationError(reason),
        "basic_publish" => AmqpError::PublishingError(reason),
        "basic_consume" => AmqpError::ConsumerDeclarationError(reason),
        "basic_ack" => AmqpError::AckMessageError(reason),
        _ => AmqpError::ChannelError(reason),
    }
}

/// A mock channel accepting every operation and logging it in `recorder`.
pub(crate) fn recording_channel(recorder: &Arc<Recorder>) -> MockAmqpChannel {
    let mut channel = MockAmqpChannel::new();

    let rec = Arc::clone(recorder);
    channel
        .expect_exchange_declare()
        .returning(move |name, kind, _, arguments| {
            rec.record(
                Call::ExchangeDeclare {
                    name: name.to_owned(),
                    kind,
                    arguments,
                },
                "exchange_declare",
            )
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_queue_declare()
        .returning(move |name, _, arguments| {
            rec.record(
                Call::QueueDeclare {
                    name: name.to_owned(),
                    arguments,
                },
                "queue_declare",
            )
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_queue_bind()
        .returning(move |queue, exchange, routing_key, _, arguments| {
            rec.record(
                Call::Bind {
                    queue: queue.to_owned(),
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    arguments,
                },
                "queue_bind",
            )
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_basic_qos()
        .returning(move |prefetch_count, prefetch_size, global| {
            rec.record(
                Call::Qos {
                    prefetch_count,
                    prefetch_size,
                    global,
                },
                "basic_qos",
            )
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_basic_publish()
        .returning(move |exchange, routing_key, payload, properties| {
            rec.record(
                Call::Publish {
                    exchange: exchange.to_owned(),
                    routing_key: routing_key.to_owned(),
                    payload: payload.to_vec(),
                    properties,
                },
                "basic_publish",
            )
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_basic_consume()
        .returning(move |queue, _, options, _| {
            rec.record(
                Call::Consume {
                    queue: queue.to_owned(),
                    no_ack: options.no_ack,
                },
                "basic_consume",
            )?;
            let receiver = rec.deliveries.lock().unwrap().pop_front();
            let stream: DeliveryStream = match receiver {
                Some(receiver) => stream::unfold(receiver, |mut receiver| async move {
                    receiver.recv().await.map(|item| (item, receiver))
                })
                .boxed(),
                None => stream::pending().boxed(),
            };
            Ok(stream)
        });

    let rec = Arc::clone(recorder);
    channel
        .expect_basic_ack()
        .returning(move |tag| rec.record(Call::Ack(tag), "basic_ack"));

    let rec = Arc::clone(recorder);
    channel
        .expect_basic_nack()
        .returning(move |tag, requeue| rec.record(Call::Nack(tag, requeue), "basic_nack"));

    let rec = Arc::clone(recorder);
    channel
        .expect_close()
        .returning(move || rec.record(Call::Close, "close"));

    channel
}

/// A delivery as the broker would hand it out.
pub(crate) fn delivery(tag: u64, body: &[u8]) -> Delivery {
    Delivery {
        delivery_tag: tag,
        data: body.to_vec(),
        ..Default::default()
    }
}
