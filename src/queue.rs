//! Handler queues: buffered event streams with one attachable consumer.
//!
//! An [`EventQueue`] decouples producers of asynchronous events from a
//! consumer that may not be attached yet. Items pushed while no handler is
//! attached are buffered; attaching a handler drains them in FIFO order.
//! Every item gets a [`Completion`] future for its handling result, so
//! nothing is ever fired with nobody listening.
//!
//! Draining is not recursive: a handler that enqueues more items while a
//! drain pass is running has those items processed by the same outer pass,
//! bounding stack growth for self-feeding handlers.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result};

type BoxFuture<R> = Pin<Box<dyn Future<Output = R> + Send>>;

enum HandlerFn<T, R> {
    Sync(Box<dyn FnMut(T) -> R + Send>),
    Async(Box<dyn FnMut(T) -> BoxFuture<R> + Send>),
}

/// A handler plus, for single-shot handlers, the waiter to notify on the
/// one item it consumes (or to fail if the handler is replaced first).
struct Attached<T, R> {
    f: HandlerFn<T, R>,
    once: Option<oneshot::Sender<Result<R>>>,
}

struct Pending<T, R> {
    item: T,
    done: oneshot::Sender<Result<R>>,
}

struct Inner<T, R> {
    pending: VecDeque<Pending<T, R>>,
    handler: Option<Attached<T, R>>,
    /// True while a drain pass is running; reentrant calls queue instead of
    /// recursing.
    draining: bool,
    /// Bumped on every handler change so a drain pass can tell whether the
    /// handler it took out was replaced underneath it.
    epoch: u64,
}

/// Future for the result of handling one queued item.
///
/// Fails with [`Error::Cleared`] if the queue is cleared (or dropped) before
/// the item is handled, and with [`Error::Cancelled`] when it belongs to a
/// single-shot consumer that was replaced.
pub struct Completion<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> Future for Completion<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cleared)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// FIFO of pending items with at most one attached handler.
///
/// `T` is the item type; `R` is the handler's result type, delivered back to
/// the producer through [`Completion`].
pub struct EventQueue<T, R = ()> {
    inner: Mutex<Inner<T, R>>,
}

impl<T, R> Default for EventQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, R> EventQueue<T, R>
where
    T: Send + 'static,
    R: Clone + Send + 'static,
{
    /// Create an empty queue with no handler attached.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pending: VecDeque::new(),
                handler: None,
                draining: false,
                epoch: 0,
            }),
        }
    }

    /// Number of items waiting to be handled.
    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// True if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }

    /// True if a handler is currently attached.
    pub fn is_handling(&self) -> bool {
        self.inner.lock().handler.is_some()
    }

    /// Handle or queue the given item.
    ///
    /// If a handler is attached the item is dispatched immediately (in this
    /// call, unless a drain pass is already running); otherwise it is
    /// buffered until one is. The returned future resolves with the
    /// handler's result.
    pub fn handle(&self, item: T) -> Completion<R> {
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock();
            inner.pending.push_back(Pending { item, done: tx });
        }
        self.drain();
        Completion { rx }
    }

    /// Attach a synchronous handler, draining all pending items through it
    /// in FIFO order.
    ///
    /// If a single-shot consumer was still waiting, its future fails with
    /// [`Error::Cancelled`].
    pub fn set_handler<F>(&self, f: F)
    where
        F: FnMut(T) -> R + Send + 'static,
    {
        self.install(Attached {
            f: HandlerFn::Sync(Box::new(f)),
            once: None,
        });
    }

    /// Attach an asynchronous handler. Each item initiates a handling step
    /// whose future is driven to completion on the runtime; drain order is
    /// the initiation order.
    pub fn set_async_handler<F, Fut>(&self, mut f: F)
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.install(Attached {
            f: HandlerFn::Async(Box::new(move |item| Box::pin(f(item)))),
            once: None,
        });
    }

    /// Attach a handler that consumes exactly one item then detaches itself.
    ///
    /// The returned future resolves with that one result, or fails with
    /// [`Error::Cancelled`] if another handler is attached first.
    pub fn once_handler<F>(&self, f: F) -> Completion<R>
    where
        F: FnMut(T) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.install(Attached {
            f: HandlerFn::Sync(Box::new(f)),
            once: Some(tx),
        });
        Completion { rx }
    }

    /// Asynchronous variant of [`EventQueue::once_handler`].
    pub fn once_async_handler<F, Fut>(&self, mut f: F) -> Completion<R>
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.install(Attached {
            f: HandlerFn::Async(Box::new(move |item| Box::pin(f(item)))),
            once: Some(tx),
        });
        Completion { rx }
    }

    /// Detach the current handler; subsequent items buffer until a new one
    /// is attached. A waiting single-shot consumer is cancelled.
    pub fn stop_handling(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        if let Some(prev) = inner.handler.take() {
            if let Some(tx) = prev.once {
                let _ = tx.send(Err(Error::Cancelled));
            }
        }
    }

    /// Empty the queue, failing every pending item's future with
    /// [`Error::Cleared`].
    pub fn clear(&self) {
        let drained: Vec<Pending<T, R>> = {
            let mut inner = self.inner.lock();
            inner.pending.drain(..).collect()
        };
        for pending in drained {
            let _ = pending.done.send(Err(Error::Cleared));
        }
    }

    fn install(&self, attached: Attached<T, R>) {
        {
            let mut inner = self.inner.lock();
            inner.epoch += 1;
            if let Some(prev) = inner.handler.take() {
                if let Some(tx) = prev.once {
                    let _ = tx.send(Err(Error::Cancelled));
                }
            }
            inner.handler = Some(attached);
        }
        self.drain();
    }

    /// Run the handler over pending items until the queue empties or the
    /// handler detaches. Exactly one drain pass runs at a time; reentrant
    /// callers just enqueue and return.
    fn drain(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.draining {
                return;
            }
            inner.draining = true;
        }
        loop {
            let (pending, mut attached, epoch) = {
                let mut inner = self.inner.lock();
                if inner.handler.is_none() || inner.pending.is_empty() {
                    inner.draining = false;
                    return;
                }
                let attached = inner.handler.take().expect("handler checked above");
                let pending = inner.pending.pop_front().expect("pending checked above");
                (pending, attached, inner.epoch)
            };

            // Single-shot handlers detach before running, so a reentrant
            // attach from inside the handler is not cancelled by mistake.
            let once_tx = attached.once.take();
            let is_once = once_tx.is_some();

            match attached.f {
                HandlerFn::Sync(ref mut f) => {
                    let result = f(pending.item);
                    if let Some(tx) = once_tx {
                        let _ = tx.send(Ok(result.clone()));
                    }
                    let _ = pending.done.send(Ok(result));
                }
                HandlerFn::Async(ref mut f) => {
                    let fut = f(pending.item);
                    let done = pending.done;
                    tokio::spawn(async move {
                        let result = fut.await;
                        if let Some(tx) = once_tx {
                            let _ = tx.send(Ok(result.clone()));
                        }
                        let _ = done.send(Ok(result));
                    });
                }
            }

            let mut inner = self.inner.lock();
            // Put the handler back unless it was single-shot or the handled
            // item swapped it for a new one.
            if !is_once && inner.epoch == epoch && inner.handler.is_none() {
                inner.handler = Some(attached);
            }
        }
    }
}
