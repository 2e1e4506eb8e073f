//! Clarification and yap routing.
//!
//! The router owns all per-consumer delivery state: the clarification
//! FIFO (one active request at a time per consumer), the yap reorder
//! buffer, and the reply correlation back to the producer recorded at
//! enqueue time. It performs no I/O; every operation returns the
//! envelopes to enqueue on session write queues.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::{
    ClarificationPayload, Envelope, Kind, ReplyPayload, RequestStatus, ResponsePayload, Role,
};

use super::registry::Registry;

pub const NO_CONSUMER_ERROR: &str = "No CLI clients available";
pub const QUEUE_FULL_ERROR: &str = "queue full";
pub const CONSUMER_LOST_ERROR: &str = "CLI client disconnected";
pub const SOURCE_LOST_REASON: &str = "Source client disconnected";

#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    /// Pending clarifications per consumer; insertions beyond this are
    /// rejected.
    pub max_clarification_queue: usize,
    /// Yaps held per consumer awaiting a flush; oldest dropped beyond
    /// this.
    pub yap_buffer_max: usize,
    /// Quiet window before a consumer's yap buffer is flushed.
    pub yap_buffer: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_clarification_queue: 10,
            yap_buffer_max: 50,
            yap_buffer: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouteError {
    #[error("{NO_CONSUMER_ERROR}")]
    NoConsumer,

    #[error("{QUEUE_FULL_ERROR}")]
    QueueFull,
}

/// An envelope bound for one registered client.
#[derive(Debug)]
pub struct Delivery {
    pub target: String,
    pub envelope: Envelope,
}

struct QueuedRequest {
    request: ClarificationPayload,
    source: String,
}

struct BufferedYap {
    timestamp: u64,
    arrival: u64,
    envelope: Envelope,
}

#[derive(Default)]
struct ConsumerState {
    queue: VecDeque<QueuedRequest>,
    buffer: Vec<BufferedYap>,
    flush_at: Option<Instant>,
}

pub struct Router {
    config: RouterConfig,
    consumers: HashMap<String, ConsumerState>,
    arrivals: u64,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            consumers: HashMap::new(),
            arrivals: 0,
        }
    }

    /// A consumer registered: create its state and run the advance
    /// path (a no-op on an empty queue).
    pub fn consumer_registered(&mut self, consumer: &str) -> Vec<Delivery> {
        self.consumers.entry(consumer.to_string()).or_default();
        self.advance(consumer)
    }

    /// Select a target, append, and advance that consumer's queue.
    pub fn route_clarification(
        &mut self,
        registry: &Registry,
        mut request: ClarificationPayload,
        source: &str,
    ) -> Result<Vec<Delivery>, RouteError> {
        let target = self.select_consumer(registry).ok_or(RouteError::NoConsumer)?;
        let state = self.consumers.entry(target.clone()).or_default();
        if state.queue.len() >= self.config.max_clarification_queue {
            return Err(RouteError::QueueFull);
        }
        request.status = RequestStatus::Pending;
        state.queue.push_back(QueuedRequest {
            request,
            source: source.to_string(),
        });
        Ok(self.advance(&target))
    }

    /// Among live consumers, the shortest queue wins; ties break to
    /// the earliest registration. Not part of the external contract,
    /// but deterministic so no consumer is starved.
    fn select_consumer(&self, registry: &Registry) -> Option<String> {
        registry
            .with_role(Role::Consumer)
            .min_by_key(|session| {
                let depth = self
                    .consumers
                    .get(&session.client_id)
                    .map(|state| state.queue.len())
                    .unwrap_or(0);
                (depth, session.registered_at)
            })
            .map(|session| session.client_id.clone())
    }

    /// Promote the queue head to active and deliver it. Idempotent
    /// when the head is already active.
    pub fn advance(&mut self, consumer: &str) -> Vec<Delivery> {
        let Some(state) = self.consumers.get_mut(consumer) else {
            return Vec::new();
        };
        let Some(head) = state.queue.front_mut() else {
            return Vec::new();
        };
        if head.request.status == RequestStatus::Active {
            return Vec::new();
        }
        head.request.status = RequestStatus::Active;
        match Envelope::with_payload(
            Kind::Clarification,
            &head.source,
            Role::Producer,
            &head.request,
        ) {
            Ok(envelope) => vec![Delivery {
                target: consumer.to_string(),
                envelope,
            }],
            Err(err) => {
                tracing::warn!(consumer, "failed to encode clarification: {err}");
                Vec::new()
            }
        }
    }

    /// Resolve the active request matching the reply, route the
    /// response to the producer recorded at enqueue time, and promote
    /// the next request. Unknown request ids are late duplicates and
    /// are ignored.
    pub fn handle_reply(
        &mut self,
        registry: &Registry,
        reply: ReplyPayload,
        consumer: &str,
    ) -> Vec<Delivery> {
        let mut out = Vec::new();
        let mut owner = None;

        for (cid, state) in &mut self.consumers {
            let Some(pos) = state.queue.iter().position(|entry| {
                entry.request.status == RequestStatus::Active && entry.request.id == reply.request_id
            }) else {
                continue;
            };
            let Some(entry) = state.queue.remove(pos) else {
                continue;
            };
            owner = Some(cid.clone());

            if registry.get(&entry.source).is_some() {
                let payload =
                    ResponsePayload::answered(&entry.request.id, reply.response.clone(), consumer);
                if let Some(delivery) = response_delivery(&entry.source, consumer, &payload) {
                    out.push(delivery);
                }
            }
            break;
        }

        out.extend(self.advance(consumer));
        if let Some(owner) = owner
            && owner != consumer
        {
            out.extend(self.advance(&owner));
        }
        out
    }

    /// Fan a yap out to every live consumer's reorder buffer and
    /// (re)arm the flush deadline.
    pub fn route_yap(&mut self, registry: &Registry, envelope: Envelope, timestamp: u64, now: Instant) {
        let arrival = self.arrivals;
        self.arrivals += 1;

        for session in registry.with_role(Role::Consumer) {
            let state = self.consumers.entry(session.client_id.clone()).or_default();
            state.buffer.push(BufferedYap {
                timestamp,
                arrival,
                envelope: envelope.clone(),
            });
            state.buffer.sort_by_key(|yap| (yap.timestamp, yap.arrival));
            while state.buffer.len() > self.config.yap_buffer_max {
                state.buffer.remove(0);
            }
            state.flush_at = Some(now + self.config.yap_buffer);
        }
    }

    /// Earliest pending flush deadline across all buffers.
    pub fn next_flush(&self) -> Option<Instant> {
        self.consumers.values().filter_map(|state| state.flush_at).min()
    }

    /// Flush every buffer whose deadline has passed, in sorted order.
    pub fn flush_due(&mut self, now: Instant) -> Vec<Delivery> {
        let mut out = Vec::new();
        for (cid, state) in &mut self.consumers {
            let Some(flush_at) = state.flush_at else {
                continue;
            };
            if flush_at > now {
                continue;
            }
            state.flush_at = None;
            for yap in state.buffer.drain(..) {
                out.push(Delivery {
                    target: cid.clone(),
                    envelope: yap.envelope,
                });
            }
        }
        out
    }

    /// A consumer vanished: discard its queue and buffer, and tell
    /// each request's source producer the request is gone. Nothing is
    /// redistributed; producers may retry.
    pub fn consumer_gone(&mut self, registry: &Registry, consumer: &str) -> Vec<Delivery> {
        let Some(state) = self.consumers.remove(consumer) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in state.queue {
            if registry.get(&entry.source).is_none() {
                continue;
            }
            let payload = ResponsePayload::failed(&entry.request.id, CONSUMER_LOST_ERROR);
            if let Some(delivery) = response_delivery(&entry.source, consumer, &payload) {
                out.push(delivery);
            }
        }
        out
    }

    /// A producer vanished: every queued request it owned becomes a
    /// terminal `timeout` clarification toward its consumer so the
    /// human can dismiss it, then leaves the queue.
    pub fn producer_gone(&mut self, producer: &str) -> Vec<Delivery> {
        let mut out = Vec::new();
        let mut reopened = Vec::new();

        for (cid, state) in &mut self.consumers {
            let mut removed_active = false;
            let mut kept = VecDeque::with_capacity(state.queue.len());
            for mut entry in state.queue.drain(..) {
                if entry.source != producer {
                    kept.push_back(entry);
                    continue;
                }
                removed_active |= entry.request.status == RequestStatus::Active;
                entry.request.status = RequestStatus::Timeout;
                entry.request.response = Some(SOURCE_LOST_REASON.to_string());
                match Envelope::with_payload(
                    Kind::Clarification,
                    producer,
                    Role::Producer,
                    &entry.request,
                ) {
                    Ok(envelope) => out.push(Delivery {
                        target: cid.clone(),
                        envelope,
                    }),
                    Err(err) => {
                        tracing::warn!(consumer = %cid, "failed to encode timeout notice: {err}");
                    }
                }
            }
            state.queue = kept;
            if removed_active {
                reopened.push(cid.clone());
            }
        }

        for cid in reopened {
            out.extend(self.advance(&cid));
        }
        out
    }

    pub fn queue_depth(&self, consumer: &str) -> usize {
        self.consumers
            .get(consumer)
            .map(|state| state.queue.len())
            .unwrap_or(0)
    }
}

fn response_delivery(
    producer: &str,
    consumer: &str,
    payload: &ResponsePayload,
) -> Option<Delivery> {
    match Envelope::with_payload(Kind::Response, consumer, Role::Consumer, payload) {
        Ok(envelope) => Some(Delivery {
            target: producer.to_string(),
            envelope,
        }),
        Err(err) => {
            tracing::warn!(producer, "failed to encode response: {err}");
            None
        }
    }
}

/// Synthesized response for a routing failure, sent straight back to
/// the source producer.
pub fn failure_response(request_id: &str, error: &RouteError) -> Envelope {
    let payload = ResponsePayload::failed(request_id, &error.to_string());
    Envelope::broker(
        Kind::Response,
        serde_json::to_value(&payload).unwrap_or(Value::Null),
    )
}
