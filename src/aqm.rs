//! Active queue management for the transport send path.
//!
//! An AQM decides, per packet, whether to admit it to the send queue and
//! whether to send it through the fast (fire-and-forget) or the traced
//! (completion-observable) path. Queue length is measured in packets, not
//! bytes, since the queue being managed is dominated by per-packet cost.
//!
//! Rejection is an admission verdict, not an error: `send` returns `false`
//! and the caller decides what dropping means for its protocol.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::trace;

/// Flow identifier, reserved for fair-queueing policies. Current policies
/// accept and ignore it.
pub type FlowId = u32;

/// Enqueues a packet with no completion signal.
pub type FastSender<T> = Box<dyn Fn(T) + Send + Sync>;

/// Enqueues a packet and returns a future that resolves once the packet has
/// left the queue.
pub type TracedSender<T> =
    Box<dyn Fn(T) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// An admission policy over fast/traced senders.
pub trait Aqm<T>: Send {
    /// Admit or drop one packet of the given flow. Returns whether the
    /// packet was handed to a sender.
    fn send(&mut self, flow: FlowId, item: T) -> bool;

    /// Adjust what fraction of admitted packets take the traced path.
    /// Policies that pin the fraction ignore this.
    fn set_tracing_fraction(&mut self, fraction: f64);
}

/// No management: every packet is admitted through the fast path and the
/// queue grows without bound.
pub struct Null<T> {
    fast: FastSender<T>,
}

impl<T> Null<T> {
    pub fn new(fast: FastSender<T>) -> Self {
        Null { fast }
    }
}

impl<T: Send> Aqm<T> for Null<T> {
    fn send(&mut self, _flow: FlowId, item: T) -> bool {
        (self.fast)(item);
        true
    }

    fn set_tracing_fraction(&mut self, _fraction: f64) {}
}

/// Hard limit on outstanding packets. Every packet is traced so the
/// outstanding count can be decremented when it leaves the queue.
pub struct TailDrop<T> {
    max_length: usize,
    outstanding: Arc<AtomicUsize>,
    traced: TracedSender<T>,
}

impl<T> TailDrop<T> {
    pub fn new(max_length: usize, traced: TracedSender<T>) -> Self {
        TailDrop {
            max_length,
            outstanding: Arc::new(AtomicUsize::new(0)),
            traced,
        }
    }

    /// Packets admitted but not yet reported sent.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl<T: Send + 'static> Aqm<T> for TailDrop<T> {
    fn send(&mut self, flow: FlowId, item: T) -> bool {
        if self.outstanding.load(Ordering::Relaxed) >= self.max_length {
            trace!(flow, "tail drop: queue full");
            return false;
        }
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        let done = (self.traced)(item);
        let outstanding = Arc::clone(&self.outstanding);
        tokio::spawn(async move {
            done.await;
            outstanding.fetch_sub(1, Ordering::Relaxed);
        });
        true
    }

    fn set_tracing_fraction(&mut self, _fraction: f64) {}
}

/// Moving-average state behind the RED policy, shared with completion tasks.
struct RedState {
    /// Last sampled queue length, in packets. 32-bit wrapping arithmetic on
    /// the counter keeps this well defined across counter overflow.
    length: i32,
    avg: f64,
    counter: i32,
    empty_at: Instant,
    empty_avg: f64,
}

/// Random Early Detection with sentinel sampling.
///
/// With a tracing fraction of 1 this is classic RED (Floyd & Jacobson): an
/// exponentially weighted moving average of queue length, with drop
/// probability rising linearly past a threshold. Lower fractions trace only
/// occasional sentinel packets, giving a Poisson-process sample of queue
/// length that is noisier but avoids a completion signal for every packet.
pub struct RedSentinel<T> {
    drop_threshold: f64,
    tracing_fraction: f64,
    fast: FastSender<T>,
    traced: TracedSender<T>,
    state: Arc<Mutex<RedState>>,
}

/// EWMA weight, a sliding window of roughly 500 packets (the value from the
/// original RED paper).
const WEIGHT: f64 = 1.0 / 500.0;

/// While the queue is empty the average decays as if packets were leaving at
/// this nominal full-speed rate, in packets per millisecond.
const SEND_RATE: f64 = 1.0;

/// Default fraction of admitted packets sent through the traced path.
pub const DEFAULT_TRACING_FRACTION: f64 = 0.2;

impl<T> RedSentinel<T> {
    pub fn new(drop_threshold: usize, fast: FastSender<T>, traced: TracedSender<T>) -> Self {
        RedSentinel {
            drop_threshold: drop_threshold as f64,
            tracing_fraction: DEFAULT_TRACING_FRACTION,
            fast,
            traced,
            state: Arc::new(Mutex::new(RedState {
                length: 0,
                avg: 0.0,
                counter: 0,
                empty_at: Instant::now(),
                empty_avg: 0.0,
            })),
        }
    }

    /// Probability of dropping at a given average queue length: zero below
    /// the threshold, rising linearly to one at twice the threshold.
    pub fn drop_probability(&self, avg: f64) -> f64 {
        if avg < self.drop_threshold || self.drop_threshold == 0.0 {
            return 0.0;
        }
        ((avg - self.drop_threshold) / self.drop_threshold).min(1.0)
    }

    fn update_avg(state: &mut RedState) {
        if state.length > 0 {
            state.avg = (1.0 - WEIGHT) * state.avg + WEIGHT * f64::from(state.length);
        } else {
            let slots = state.empty_at.elapsed().as_millis() as f64 * SEND_RATE;
            state.avg = state.empty_avg * (1.0 - WEIGHT).powf(slots);
        }
    }

    #[cfg(test)]
    fn set_avg_for_test(&self, avg: f64) {
        let mut state = self.state.lock();
        state.length = 0;
        state.empty_avg = avg;
        state.empty_at = Instant::now();
        state.avg = avg;
    }
}

impl<T: Send + 'static> Aqm<T> for RedSentinel<T> {
    fn send(&mut self, flow: FlowId, item: T) -> bool {
        let counter_at_send = {
            let mut state = self.state.lock();
            Self::update_avg(&mut state);
            if state.avg >= self.drop_threshold
                && state.avg - self.drop_threshold > self.drop_threshold * rand::random::<f64>()
            {
                trace!(flow, avg = state.avg, "early drop");
                return false;
            }
            state.counter = state.counter.wrapping_add(1);
            state.counter
        };

        if rand::random::<f64>() >= self.tracing_fraction {
            (self.fast)(item);
        } else {
            let done = (self.traced)(item);
            let shared = Arc::clone(&self.state);
            tokio::spawn(async move {
                done.await;
                let mut state = shared.lock();
                state.length = state.counter.wrapping_sub(counter_at_send);
                if state.length == 0 {
                    state.empty_at = Instant::now();
                    state.empty_avg = state.avg;
                }
            });
        }
        true
    }

    fn set_tracing_fraction(&mut self, fraction: f64) {
        self.tracing_fraction = fraction;
    }
}
