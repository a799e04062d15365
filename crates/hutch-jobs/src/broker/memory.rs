//! In-process broker.
//!
//! Implements the subset of AMQP 0-9-1 semantics the work queue relies on:
//! virtual hosts and users, the default exchange, direct and fanout
//! exchanges, priority queues, per-message TTL, dead-letter exchanges and
//! routing keys, consumer prefetch, and requeueing of unacknowledged
//! messages when a consumer rejects them or its connection closes.
//!
//! Per-message TTL follows RabbitMQ: a message whose TTL has run out is
//! only dead-lettered once it reaches the head of its queue, so it can be
//! held up by a longer-lived message ahead of it.

use super::{
    AckHandle, BrokerConnection, Connector, Delivery, DeliveryStream, ExchangeKind, Message, QueueSpec,
    DEFAULT_EXCHANGE,
};
use crate::error::{JobError, JobResult};
use async_trait::async_trait;
use futures::StreamExt;
use hutch_config::{BrokerUrl, DEFAULT_VHOST};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const TRANSPORT: &str = "memory";

fn not_connected() -> JobError {
    JobError::NotConnected {
        transport: TRANSPORT.to_string(),
    }
}

/// An in-process message broker.
///
/// Cloning is cheap; clones share the same state. Starts with the `/`
/// virtual host and a `guest`/`guest` user.
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// let queue = WorkQueue::new(config, Arc::new(broker.clone()))?;
/// ```
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    ids: Arc<AtomicU64>,
}

struct State {
    users: HashMap<String, String>,
    vhosts: HashMap<String, VHost>,
}

impl State {
    fn vhost_mut(&mut self, name: &str, id: u64) -> Option<&mut VHost> {
        self.vhosts.get_mut(name).filter(|v| v.id == id)
    }
}

struct VHost {
    id: u64,
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct Queue {
    spec: QueueSpec,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<Consumer>,
    cursor: usize,
}

#[derive(Clone)]
struct Stored {
    id: u64,
    exchange: String,
    routing_key: String,
    message: Message,
    redelivered: bool,
    /// TTL ran out while the message was not at the head of the queue.
    expired: bool,
}

struct Unacked {
    stored: Stored,
    consumer_tag: String,
    connection: u64,
}

struct Consumer {
    tag: String,
    connection: u64,
    open: Arc<AtomicBool>,
    prefetch: usize,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Debug, Clone, Copy)]
enum Settle {
    Ack,
    Requeue,
    Reject,
}

/// Everything a connection, timer or acker needs to find its vhost again.
#[derive(Clone)]
struct Link {
    broker: MemoryBroker,
    vhost: String,
    vhost_id: u64,
}

impl Link {
    fn schedule_expiry(&self, queue: &str, message_id: u64, ttl_ms: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(queue, "no async runtime; message TTL will not be enforced");
            return;
        };
        let link = self.clone();
        let queue = queue.to_string();
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ttl_ms)).await;
            link.broker.expire(&link, &queue, message_id);
        });
    }
}

impl Queue {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Inserts a ready message. Priority queues keep higher priorities
    /// first and FIFO order within a priority; `front` places a requeued
    /// message ahead of its peers.
    fn push_ready(&mut self, stored: Stored, front: bool) {
        let Some(max) = self.spec.max_priority else {
            if front {
                self.ready.push_front(stored);
            } else {
                self.ready.push_back(stored);
            }
            return;
        };
        let level = |s: &Stored| s.message.properties.priority.unwrap_or(0).min(max);
        let own = level(&stored);
        let position = if front {
            self.ready.iter().position(|s| level(s) <= own)
        } else {
            self.ready.iter().position(|s| level(s) < own)
        };
        self.ready.insert(position.unwrap_or(self.ready.len()), stored);
    }

    /// Round-robin pick of a consumer with spare prefetch capacity.
    fn next_consumer(&mut self) -> Option<usize> {
        let count = self.consumers.len();
        for offset in 0..count {
            let index = (self.cursor + offset) % count;
            let consumer = &self.consumers[index];
            if consumer.prefetch == 0 || consumer.in_flight < consumer.prefetch {
                self.cursor = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

impl VHost {
    fn new(id: u64) -> Self {
        Self {
            id,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    fn route(&mut self, link: &Link, exchange: &str, routing_key: &str, message: Message) -> JobResult<usize> {
        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if self.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let target = self.exchanges.get(exchange).ok_or_else(|| {
                JobError::Transport(format!(
                    "NOT_FOUND - no exchange '{exchange}' in vhost '{}'",
                    link.vhost
                ))
            })?;
            let mut targets = Vec::new();
            for binding in &target.bindings {
                let matches = match target.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                };
                if matches && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            trace!(exchange, routing_key, "unroutable message dropped");
        }
        for queue in &targets {
            let stored = Stored {
                id: link.broker.next_id(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
                redelivered: false,
                expired: false,
            };
            self.enqueue(link, queue, stored);
        }
        Ok(targets.len())
    }

    fn enqueue(&mut self, link: &Link, queue_name: &str, stored: Stored) {
        let ttl = stored.message.expiration_ms();
        let id = stored.id;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        queue.push_ready(stored, false);
        self.dispatch(link, queue_name);

        let Some(ttl) = ttl else {
            return;
        };
        let waiting = self
            .queues
            .get(queue_name)
            .is_some_and(|q| q.ready.iter().any(|s| s.id == id));
        if !waiting {
            return;
        }
        if ttl == 0 {
            self.expire(link, queue_name, id);
        } else {
            link.schedule_expiry(queue_name, id, ttl);
        }
    }

    fn expire(&mut self, link: &Link, queue_name: &str, id: u64) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let Some(stored) = queue.ready.iter_mut().find(|s| s.id == id) else {
            return;
        };
        stored.expired = true;
        self.drop_expired_head(link, queue_name);
    }

    /// Dead-letters expired messages sitting at the head of a queue.
    fn drop_expired_head(&mut self, link: &Link, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if !queue.ready.front().is_some_and(|s| s.expired) {
                return;
            }
            let Some(stored) = queue.ready.pop_front() else {
                return;
            };
            trace!(queue = queue_name, "message expired");
            self.dead_letter(link, queue_name, stored, "expired");
        }
    }

    fn dead_letter(&mut self, link: &Link, queue_name: &str, stored: Stored, reason: &str) {
        let Some(queue) = self.queues.get(queue_name) else {
            return;
        };
        let Some(exchange) = queue.spec.dead_letter_exchange.clone() else {
            trace!(queue = queue_name, reason, "no dead-letter exchange, message dropped");
            return;
        };
        let routing_key = queue
            .spec
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| stored.routing_key.clone());

        let mut message = stored.message;
        message.properties.expiration = None;
        let headers = &mut message.properties.headers;
        headers
            .entry("x-first-death-queue".to_string())
            .or_insert_with(|| queue_name.into());
        headers
            .entry("x-first-death-reason".to_string())
            .or_insert_with(|| reason.into());
        headers
            .entry("x-first-death-exchange".to_string())
            .or_insert_with(|| stored.exchange.clone().into());

        if let Err(e) = self.route(link, &exchange, &routing_key, message) {
            warn!(queue = queue_name, exchange = %exchange, error = %e, "dead-lettering failed");
        }
    }

    fn dispatch(&mut self, link: &Link, queue_name: &str) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let mut expired = Vec::new();
        while let Some(front) = queue.ready.front() {
            if front.expired {
                expired.extend(queue.ready.pop_front());
                continue;
            }
            let Some(index) = queue.next_consumer() else {
                break;
            };
            let Some(stored) = queue.ready.pop_front() else {
                break;
            };
            let tag = link.broker.next_id();
            let consumer = &mut queue.consumers[index];
            let acker = MemoryAcker {
                link: link.clone(),
                queue: queue_name.to_string(),
                tag,
                open: consumer.open.clone(),
            };
            let delivery = Delivery::new(stored.message.clone(), stored.redelivered, Box::new(acker));
            if consumer.tx.send(delivery).is_err() {
                debug!(queue = queue_name, consumer = %consumer.tag, "consumer went away");
                queue.consumers.remove(index);
                queue.ready.push_front(stored);
                continue;
            }
            consumer.in_flight += 1;
            let unacked = Unacked {
                stored,
                consumer_tag: consumer.tag.clone(),
                connection: consumer.connection,
            };
            queue.unacked.insert(tag, unacked);
        }
        for stored in expired {
            trace!(queue = queue_name, "message expired");
            self.dead_letter(link, queue_name, stored, "expired");
        }
        self.drop_expired_head(link, queue_name);
    }
}

impl MemoryBroker {
    /// Creates a broker with the default virtual host and guest user.
    pub fn new() -> Self {
        let ids = Arc::new(AtomicU64::new(1));
        let mut vhosts = HashMap::new();
        vhosts.insert(DEFAULT_VHOST.to_string(), VHost::new(0));
        let mut users = HashMap::new();
        users.insert("guest".to_string(), "guest".to_string());
        Self {
            state: Arc::new(Mutex::new(State { users, vhosts })),
            ids,
        }
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates a virtual host. Returns false if it already exists.
    pub fn create_vhost(&self, name: &str) -> bool {
        let id = self.next_id();
        let mut state = self.state.lock();
        if state.vhosts.contains_key(name) {
            return false;
        }
        state.vhosts.insert(name.to_string(), VHost::new(id));
        true
    }

    /// Deletes a virtual host with everything in it. Connections to it
    /// report disconnected and their consumer streams end.
    pub fn delete_vhost(&self, name: &str) -> bool {
        let removed = self.state.lock().vhosts.remove(name);
        removed.is_some()
    }

    /// Adds a user or replaces its password.
    pub fn add_user(&self, username: &str, password: &str) {
        self.state
            .lock()
            .users
            .insert(username.to_string(), password.to_string());
    }

    /// Returns true if the queue exists.
    pub fn queue_exists(&self, vhost: &str, queue: &str) -> bool {
        self.with_queue(vhost, queue, |_| ()).is_some()
    }

    /// Returns true if the exchange exists.
    pub fn exchange_exists(&self, vhost: &str, exchange: &str) -> bool {
        self.state
            .lock()
            .vhosts
            .get(vhost)
            .is_some_and(|v| v.exchanges.contains_key(exchange))
    }

    /// Number of messages waiting for delivery.
    pub fn message_count(&self, vhost: &str, queue: &str) -> usize {
        self.with_queue(vhost, queue, |q| q.ready.len()).unwrap_or(0)
    }

    /// Number of delivered but unsettled messages.
    pub fn unacked_count(&self, vhost: &str, queue: &str) -> usize {
        self.with_queue(vhost, queue, |q| q.unacked.len()).unwrap_or(0)
    }

    /// Number of active consumers.
    pub fn consumer_count(&self, vhost: &str, queue: &str) -> usize {
        self.with_queue(vhost, queue, |q| q.consumers.len()).unwrap_or(0)
    }

    /// Copies of the messages waiting in a queue, in delivery order.
    pub fn queue_messages(&self, vhost: &str, queue: &str) -> Vec<Message> {
        self.with_queue(vhost, queue, |q| q.ready.iter().map(|s| s.message.clone()).collect())
            .unwrap_or_default()
    }

    fn with_queue<R>(&self, vhost: &str, queue: &str, f: impl FnOnce(&Queue) -> R) -> Option<R> {
        let state = self.state.lock();
        state.vhosts.get(vhost)?.queues.get(queue).map(f)
    }

    fn expire(&self, link: &Link, queue: &str, message_id: u64) {
        let mut state = self.state.lock();
        if let Some(vhost) = state.vhost_mut(&link.vhost, link.vhost_id) {
            vhost.expire(link, queue, message_id);
        }
    }

    fn settle(&self, link: &Link, queue_name: &str, tag: u64, outcome: Settle) -> JobResult<()> {
        let mut state = self.state.lock();
        let vhost = state
            .vhost_mut(&link.vhost, link.vhost_id)
            .ok_or_else(not_connected)?;
        let queue = vhost
            .queues
            .get_mut(queue_name)
            .ok_or_else(|| JobError::Transport(format!("NOT_FOUND - no queue '{queue_name}'")))?;
        let unacked = queue.unacked.remove(&tag).ok_or_else(|| {
            JobError::Transport(format!("PRECONDITION_FAILED - unknown delivery tag {tag}"))
        })?;
        if let Some(consumer) = queue
            .consumers
            .iter_mut()
            .find(|c| c.tag == unacked.consumer_tag && c.connection == unacked.connection)
        {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match outcome {
            Settle::Ack => {}
            Settle::Requeue => {
                let mut stored = unacked.stored;
                stored.redelivered = true;
                queue.push_ready(stored, true);
            }
            Settle::Reject => vhost.dead_letter(link, queue_name, unacked.stored, "rejected"),
        }
        vhost.dispatch(link, queue_name);
        Ok(())
    }

    /// Drops the connection's consumers and returns its unacknowledged
    /// messages to the front of their queues.
    fn close_connection(&self, link: &Link, connection: u64) {
        let mut state = self.state.lock();
        let Some(vhost) = state.vhost_mut(&link.vhost, link.vhost_id) else {
            return;
        };
        let names: Vec<String> = vhost.queues.keys().cloned().collect();
        for name in names {
            let Some(queue) = vhost.queues.get_mut(&name) else {
                continue;
            };
            queue.consumers.retain(|c| c.connection != connection);
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, u)| u.connection == connection)
                .map(|(tag, _)| *tag)
                .collect();
            tags.sort_unstable();
            for tag in tags.into_iter().rev() {
                if let Some(unacked) = queue.unacked.remove(&tag) {
                    let mut stored = unacked.stored;
                    stored.redelivered = true;
                    queue.push_ready(stored, true);
                }
            }
            vhost.dispatch(link, &name);
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let mut vhosts: Vec<&String> = state.vhosts.keys().collect();
        vhosts.sort();
        f.debug_struct("MemoryBroker").field("vhosts", &vhosts).finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    fn transport(&self) -> &'static str {
        TRANSPORT
    }

    async fn connect(&self, url: &BrokerUrl) -> JobResult<Arc<dyn BrokerConnection>> {
        let link = {
            let state = self.state.lock();
            match state.users.get(url.username()) {
                Some(password) if password == url.password() => {}
                _ => {
                    return Err(JobError::Transport(
                        "ACCESS_REFUSED - Login was refused using authentication mechanism PLAIN".to_string(),
                    ))
                }
            }
            let vhost = state.vhosts.get(url.vhost()).ok_or_else(|| {
                JobError::Transport(format!("NOT_ALLOWED - vhost {} not found", url.vhost()))
            })?;
            Link {
                broker: self.clone(),
                vhost: url.vhost().to_string(),
                vhost_id: vhost.id,
            }
        };
        let id = self.next_id();
        debug!(vhost = %link.vhost, connection = id, "memory connection opened");
        Ok(Arc::new(MemoryConnection {
            link,
            id,
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

struct MemoryConnection {
    link: Link,
    id: u64,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn with_vhost<R>(&self, f: impl FnOnce(&mut VHost) -> JobResult<R>) -> JobResult<R> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(not_connected());
        }
        let mut state = self.link.broker.state.lock();
        let vhost = state
            .vhost_mut(&self.link.vhost, self.link.vhost_id)
            .ok_or_else(not_connected)?;
        f(vhost)
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .link
                .broker
                .state
                .lock()
                .vhost_mut(&self.link.vhost, self.link.vhost_id)
                .is_some()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> JobResult<()> {
        if name == DEFAULT_EXCHANGE || name.starts_with("amq.") {
            return Err(JobError::Transport(format!(
                "ACCESS_REFUSED - exchange name '{name}' is reserved"
            )));
        }
        self.with_vhost(|vhost| match vhost.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(JobError::Transport(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{name}': received '{}' but current is '{}'",
                kind.as_str(),
                existing.kind.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                vhost.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        })
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> JobResult<()> {
        self.with_vhost(|vhost| match vhost.queues.get(&spec.name) {
            Some(existing) if existing.spec != *spec => Err(JobError::Transport(format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}'",
                spec.name
            ))),
            Some(_) => Ok(()),
            None => {
                vhost.queues.insert(spec.name.clone(), Queue::new(spec.clone()));
                Ok(())
            }
        })
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> JobResult<()> {
        self.with_vhost(|vhost| {
            if !vhost.queues.contains_key(queue) {
                return Err(JobError::Transport(format!("NOT_FOUND - no queue '{queue}'")));
            }
            let target = vhost
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| JobError::Transport(format!("NOT_FOUND - no exchange '{exchange}'")))?;
            let exists = target
                .bindings
                .iter()
                .any(|b| b.queue == queue && b.routing_key == routing_key);
            if !exists {
                target.bindings.push(Binding {
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                });
            }
            Ok(())
        })
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: Message) -> JobResult<()> {
        if let Some(expiration) = &message.properties.expiration {
            if expiration.parse::<u64>().is_err() {
                return Err(JobError::Transport(format!(
                    "PRECONDITION_FAILED - invalid expiration '{expiration}'"
                )));
            }
        }
        let link = self.link.clone();
        self.with_vhost(|vhost| vhost.route(&link, exchange, routing_key, message))
            .map(|_| ())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> JobResult<DeliveryStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = self.link.clone();
        self.with_vhost(|vhost| {
            let target = vhost
                .queues
                .get_mut(queue)
                .ok_or_else(|| JobError::Transport(format!("NOT_FOUND - no queue '{queue}'")))?;
            if target.consumers.iter().any(|c| c.tag == consumer_tag) {
                return Err(JobError::Transport(format!(
                    "NOT_ALLOWED - attempt to reuse consumer tag '{consumer_tag}'"
                )));
            }
            target.consumers.push(Consumer {
                tag: consumer_tag.to_string(),
                connection: self.id,
                open: self.open.clone(),
                prefetch: usize::from(prefetch),
                in_flight: 0,
                tx,
            });
            vhost.dispatch(&link, queue);
            Ok(())
        })?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (Ok(delivery), rx))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> JobResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.link.broker.close_connection(&self.link, self.id);
            debug!(vhost = %self.link.vhost, connection = self.id, "memory connection closed");
        }
        Ok(())
    }
}

struct MemoryAcker {
    link: Link,
    queue: String,
    tag: u64,
    open: Arc<AtomicBool>,
}

impl MemoryAcker {
    fn settle(&self, outcome: Settle) -> JobResult<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(not_connected());
        }
        self.link.broker.settle(&self.link, &self.queue, self.tag, outcome)
    }
}

#[async_trait]
impl AckHandle for MemoryAcker {
    async fn ack(&self) -> JobResult<()> {
        self.settle(Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> JobResult<()> {
        self.settle(if requeue { Settle::Requeue } else { Settle::Reject })
    }
}
