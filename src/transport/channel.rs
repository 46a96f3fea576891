//! Labelled bidirectional data channels over a peer connection.
//!
//! A channel buffers bytes from the peer in a queue until the application
//! attaches a handler, and pushes bytes to the peer as data frames through
//! the connection's AQM. Lifecycle is the connection's four states scoped to
//! one channel: CONNECTING until the remote acknowledges the open, CONNECTED
//! while usable, DISCONNECTED once either side closes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::aqm::{Aqm, FlowId};
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::transport::frame::{Frame, MAX_CHANNEL_PAYLOAD};
use crate::transport::State;

pub(crate) type SharedAqm = Arc<Mutex<Box<dyn Aqm<Frame>>>>;

/// One labelled channel multiplexed over a peer connection.
pub struct DataChannel {
    label: String,
    state_tx: watch::Sender<State>,
    was_connected: AtomicBool,
    /// Bytes from the peer, buffered until the application attaches a
    /// handler.
    pub data_from_peer_queue: EventQueue<Bytes>,
    outbound: Arc<EventQueue<Frame>>,
    aqm: SharedAqm,
    flow_id: FlowId,
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl DataChannel {
    pub(crate) fn new(
        label: String,
        initial_state: State,
        outbound: Arc<EventQueue<Frame>>,
        aqm: SharedAqm,
        flow_id: FlowId,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(initial_state);
        let channel = Arc::new(DataChannel {
            label,
            state_tx,
            was_connected: AtomicBool::new(initial_state == State::Connected),
            data_from_peer_queue: EventQueue::new(),
            outbound,
            aqm,
            flow_id,
        });
        channel
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    /// Advance the lifecycle. Transitions are monotonic; stale or repeated
    /// transitions are ignored.
    pub(crate) fn set_state(&self, new: State) {
        self.state_tx.send_if_modified(|current| {
            if new > *current {
                if new == State::Connected {
                    self.was_connected.store(true, Ordering::Relaxed);
                }
                *current = new;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the channel reaches CONNECTED; fails if it closes
    /// without ever having connected.
    pub async fn once_opened(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                State::Connected => return Ok(()),
                State::Disconnected => {
                    return if self.was_connected.load(Ordering::Relaxed) {
                        Ok(())
                    } else {
                        Err(Error::transport(format!(
                            "channel {} closed before opening",
                            self.label
                        )))
                    };
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(Error::transport(format!(
                    "channel {} dropped before opening",
                    self.label
                )));
            }
        }
    }

    /// Resolves once the channel reaches DISCONNECTED.
    pub async fn once_closed(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow_and_update() == State::Disconnected {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Send bytes to the peer, chunked into data frames and admitted through
    /// the connection's AQM.
    ///
    /// `Ok(true)` means every chunk was admitted; `Ok(false)` means the AQM
    /// dropped one and sending stopped there. Sends on a channel whose open
    /// is still unacknowledged ride the wire behind the open frame, so they
    /// are admitted; only a closed channel is an error.
    pub fn send(&self, data: Bytes) -> Result<bool> {
        if self.state() == State::Disconnected {
            return Err(Error::ChannelNotOpen(self.label.clone()));
        }
        let mut offset = 0;
        while offset < data.len() {
            let end = usize::min(offset + MAX_CHANNEL_PAYLOAD, data.len());
            let frame = Frame::data(self.label.clone(), data.slice(offset..end));
            let admitted = self.aqm.lock().send(self.flow_id, frame);
            if !admitted {
                debug!(label = %self.label, "send dropped by queue management");
                return Ok(false);
            }
            offset = end;
        }
        Ok(true)
    }

    /// Receive the next message from the peer. Detaches any previously
    /// attached data handler when it takes its turn as the single-shot
    /// consumer.
    pub async fn receive_next(&self) -> Result<Bytes> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let mut slot = Some(tx);
        let completion = self.data_from_peer_queue.once_handler(move |data: Bytes| {
            if let Some(tx) = slot.take() {
                let _ = tx.send(data);
            }
        });
        completion.await?;
        rx.await.map_err(|_| Error::Cleared)
    }

    /// Gracefully close: tell the peer, then mark the channel closed.
    pub fn close(&self) {
        if self.state() == State::Disconnected {
            return;
        }
        // Close frames bypass the AQM; control traffic is never dropped.
        let _ = self.outbound.handle(Frame::close(self.label.clone()));
        self.set_state(State::Disconnected);
    }

    /// Forced teardown from the connection side: no close frame, pending
    /// inbound data is discarded.
    pub(crate) fn abort(&self) {
        self.set_state(State::Disconnected);
        self.data_from_peer_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aqm::Null;

    fn test_channel(initial: State) -> (Arc<DataChannel>, Arc<EventQueue<Frame>>) {
        let outbound: Arc<EventQueue<Frame>> = Arc::new(EventQueue::new());
        let fast_outbound = Arc::clone(&outbound);
        let aqm: SharedAqm = Arc::new(Mutex::new(Box::new(Null::new(Box::new(move |frame| {
            let _ = fast_outbound.handle(frame);
        })))));
        let channel = DataChannel::new("test".into(), initial, Arc::clone(&outbound), aqm, 1);
        (channel, outbound)
    }

    #[tokio::test]
    async fn test_send_chunks_large_payload() {
        let (channel, outbound) = test_channel(State::Connected);
        let frames = Arc::new(Mutex::new(Vec::new()));
        let frames2 = Arc::clone(&frames);
        outbound.set_handler(move |frame: Frame| {
            frames2.lock().push(frame);
        });

        let payload = Bytes::from(vec![0xAB; MAX_CHANNEL_PAYLOAD * 2 + 100]);
        assert!(channel.send(payload).unwrap());

        let frames = frames.lock();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].payload.len(), MAX_CHANNEL_PAYLOAD);
        assert_eq!(frames[1].payload.len(), MAX_CHANNEL_PAYLOAD);
        assert_eq!(frames[2].payload.len(), 100);
    }

    #[tokio::test]
    async fn test_send_on_closed_channel_fails() {
        let (channel, _outbound) = test_channel(State::Connected);
        channel.abort();
        let err = channel.send(Bytes::from_static(b"late")).unwrap_err();
        assert_eq!(err, Error::ChannelNotOpen("test".into()));
    }

    #[tokio::test]
    async fn test_once_opened_resolves_on_connect() {
        let (channel, _outbound) = test_channel(State::Connecting);
        let waiter = Arc::clone(&channel);
        let task = tokio::spawn(async move { waiter.once_opened().await });
        channel.set_state(State::Connected);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_once_opened_fails_if_never_connected() {
        let (channel, _outbound) = test_channel(State::Connecting);
        channel.abort();
        assert!(channel.once_opened().await.is_err());
    }

    #[tokio::test]
    async fn test_receive_next() {
        let (channel, _outbound) = test_channel(State::Connected);
        let _ = channel
            .data_from_peer_queue
            .handle(Bytes::from_static(b"payload"));
        let data = channel.receive_next().await.unwrap();
        assert_eq!(data, Bytes::from_static(b"payload"));
    }

    #[tokio::test]
    async fn test_close_emits_close_frame() {
        let (channel, outbound) = test_channel(State::Connected);
        channel.close();
        assert_eq!(channel.state(), State::Disconnected);

        let frames = Arc::new(Mutex::new(Vec::new()));
        let frames2 = Arc::clone(&frames);
        outbound.set_handler(move |frame: Frame| {
            frames2.lock().push(frame);
        });
        let frames = frames.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].frame_type, crate::transport::frame::FrameType::ChannelClose);

        // Closing again is a no-op.
        drop(frames);
        channel.close();
    }

    #[tokio::test]
    async fn test_state_transitions_are_monotonic() {
        let (channel, _outbound) = test_channel(State::Connecting);
        channel.set_state(State::Connected);
        channel.set_state(State::Connecting);
        assert_eq!(channel.state(), State::Connected);
        channel.set_state(State::Disconnected);
        channel.set_state(State::Connected);
        assert_eq!(channel.state(), State::Disconnected);
    }
}
