//! Peer connection negotiation and channel multiplexing.
//!
//! A `PeerConnection` owns the WAITING → CONNECTING → CONNECTED →
//! DISCONNECTED machine, the set of labelled channels, and the admission
//! policy gating channel data onto the outbound frame queue. Signalling and
//! the wire itself are the embedder's job: signals leave through
//! `signal_for_peer_queue`, frames leave through the outbound queue and
//! arrive via [`PeerConnection::handle_frame`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aqm::{Aqm, Null, RedSentinel, TailDrop};
use crate::error::{Error, Result};
use crate::queue::EventQueue;
use crate::socks::Endpoint;
use crate::transport::channel::{DataChannel, SharedAqm};
use crate::transport::frame::{Frame, FrameType};
use crate::transport::signalling::{
    string_hash, Candidate, SessionDescription, SignalMessage, SignalType,
};
use crate::transport::State;

/// ICE-style host candidate priority: type preference 126 in the top byte.
const HOST_CANDIDATE_PRIORITY: u32 = 126 << 24;

/// Which admission policy gates channel data onto the outbound queue.
#[derive(Debug, Clone, Default)]
pub enum AqmPolicy {
    /// Admit everything; the queue grows without bound.
    #[default]
    Null,
    /// Hard cap on outstanding frames.
    TailDrop { max_length: usize },
    /// RED with sentinel sampling.
    RedSentinel {
        drop_threshold: usize,
        tracing_fraction: f64,
    },
}

#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    /// Name used in logs; a random one is generated if absent.
    pub peer_name: Option<String>,
    /// Address this side offers to receive on.
    pub local_endpoint: Endpoint,
    pub aqm: AqmPolicy,
}

/// The address pair a connection settled on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionAddresses {
    pub local: Endpoint,
    pub remote: Endpoint,
}

/// A connection to one peer, multiplexing labelled data channels.
pub struct PeerConnection {
    peer_name: String,
    local_endpoint: Endpoint,
    session_id: u64,
    state_tx: watch::Sender<State>,
    connect_error: Mutex<Option<Error>>,

    channels: Arc<Mutex<HashMap<String, Arc<DataChannel>>>>,
    next_flow_id: AtomicU32,

    /// Signalling messages for the peer; the embedder attaches a handler
    /// that delivers them out of band.
    pub signal_for_peer_queue: EventQueue<SignalMessage>,
    /// Channels the peer opened toward us.
    pub peer_opened_channel_queue: EventQueue<Arc<DataChannel>>,
    /// Candidates from the peer, buffered until a description is in place.
    pub from_peer_candidate_queue: EventQueue<Candidate>,

    outbound_frames: Arc<EventQueue<Frame>>,
    aqm: SharedAqm,

    local_description: Mutex<Option<SessionDescription>>,
    remote_description: Mutex<Option<SessionDescription>>,
    remote_candidate: Arc<Mutex<Option<Candidate>>>,
}

impl PeerConnection {
    pub fn new(config: PeerConnectionConfig) -> Arc<Self> {
        let peer_name = config
            .peer_name
            .unwrap_or_else(|| format!("pc-{}", rand::random::<u32>()));
        let outbound_frames: Arc<EventQueue<Frame>> = Arc::new(EventQueue::new());
        let aqm = build_aqm(&config.aqm, Arc::clone(&outbound_frames));
        let (state_tx, _) = watch::channel(State::Waiting);
        Arc::new(PeerConnection {
            peer_name,
            local_endpoint: config.local_endpoint,
            session_id: rand::random(),
            state_tx,
            connect_error: Mutex::new(None),
            channels: Arc::new(Mutex::new(HashMap::new())),
            next_flow_id: AtomicU32::new(1),
            signal_for_peer_queue: EventQueue::new(),
            peer_opened_channel_queue: EventQueue::new(),
            from_peer_candidate_queue: EventQueue::new(),
            outbound_frames,
            aqm,
            local_description: Mutex::new(None),
            remote_description: Mutex::new(None),
            remote_candidate: Arc::new(Mutex::new(None)),
        })
    }

    pub fn state(&self) -> State {
        *self.state_tx.borrow()
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Queue of frames bound for the wire. The embedder attaches a handler
    /// that writes them out.
    pub fn outbound_frames(&self) -> Arc<EventQueue<Frame>> {
        Arc::clone(&self.outbound_frames)
    }

    /// The negotiated address pair, once connected. The remote address is
    /// the best candidate received, falling back to the peer's description.
    pub fn connection_addresses(&self) -> Option<ConnectionAddresses> {
        if self.state() != State::Connected {
            return None;
        }
        let remote = self
            .remote_candidate
            .lock()
            .as_ref()
            .map(|c| c.endpoint.clone())
            .or_else(|| {
                self.remote_description
                    .lock()
                    .as_ref()
                    .map(|d| d.endpoint.clone())
            })?;
        Some(ConnectionAddresses {
            local: self.local_endpoint.clone(),
            remote,
        })
    }

    fn set_state(&self, new: State) {
        self.state_tx.send_if_modified(|current| {
            if new > *current {
                debug!(peer = %self.peer_name, ?current, ?new, "state transition");
                *current = new;
                true
            } else {
                false
            }
        });
    }

    /// Start negotiation as the offering side and wait until connected,
    /// resolving with the negotiated address pair.
    ///
    /// Emits OFFER, this side's host CANDIDATE and NO_MORE_CANDIDATES on
    /// `signal_for_peer_queue`.
    pub async fn negotiate_connection(&self) -> Result<ConnectionAddresses> {
        if self.state() != State::Waiting {
            return Err(Error::protocol("negotiation already started"));
        }
        self.set_state(State::Connecting);

        let description = SessionDescription {
            session_id: self.session_id,
            endpoint: self.local_endpoint.clone(),
        };
        *self.local_description.lock() = Some(description.clone());

        let _ = self
            .signal_for_peer_queue
            .handle(SignalMessage::offer(description));
        self.emit_local_candidates();

        self.once_connected().await?;
        self.connection_addresses()
            .ok_or_else(|| Error::transport("connected without negotiated addresses"))
    }

    /// Resolves when the connection reaches CONNECTED; fails with the
    /// negotiation error if it dies first.
    pub async fn once_connected(&self) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            match *rx.borrow_and_update() {
                State::Connected => return Ok(()),
                State::Disconnected => return Err(self.take_connect_error()),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.take_connect_error());
            }
        }
    }

    /// Resolves when the connection reaches DISCONNECTED.
    pub async fn once_disconnected(&self) {
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

    fn take_connect_error(&self) -> Error {
        self.connect_error
            .lock()
            .clone()
            .unwrap_or_else(|| Error::transport("connection closed"))
    }

    /// Process one signalling message from the peer.
    pub fn handle_signal_message(&self, signal: SignalMessage) -> Result<()> {
        if self.state() == State::Disconnected {
            return Err(Error::transport("signal received after disconnect"));
        }
        signal.validate()?;
        debug!(peer = %self.peer_name, signal = ?signal.signal_type, "handling signal");

        match signal.signal_type {
            SignalType::Offer => {
                let description = signal.description.expect("validated above");
                self.handle_offer(description)
            }
            SignalType::Answer => {
                let description = signal.description.expect("validated above");
                if self.state() != State::Connecting {
                    let err = Error::protocol("ANSWER received outside negotiation");
                    self.close_with_error(err.clone());
                    return Err(err);
                }
                *self.remote_description.lock() = Some(description);
                self.attach_candidate_handler();
                self.complete_connection();
                Ok(())
            }
            SignalType::Candidate => {
                let _ = self
                    .from_peer_candidate_queue
                    .handle(signal.candidate.expect("validated above"));
                Ok(())
            }
            SignalType::NoMoreCandidates => {
                debug!(peer = %self.peer_name, "no more candidates");
                Ok(())
            }
        }
    }

    fn handle_offer(&self, remote: SessionDescription) -> Result<()> {
        // Simultaneous offers: whoever's serialized description hashes
        // lower yields, the same on both sides, so exactly one backs off.
        if self.state() == State::Connecting && self.remote_description.lock().is_none() {
            if let Some(local) = self.local_description.lock().clone() {
                let remote_json =
                    serde_json::to_string(&remote).map_err(|e| Error::protocol(e.to_string()))?;
                let local_json =
                    serde_json::to_string(&local).map_err(|e| Error::protocol(e.to_string()))?;
                if string_hash(&remote_json) < string_hash(&local_json) {
                    let err = Error::transport("simultaneous offers: this side yields");
                    self.close_with_error(err.clone());
                    return Err(err);
                }
            }
        }

        self.set_state(State::Connecting);
        *self.remote_description.lock() = Some(remote);

        // Answering side: produce our description now if negotiation was
        // not already started locally.
        let local = {
            let mut guard = self.local_description.lock();
            guard
                .get_or_insert_with(|| SessionDescription {
                    session_id: self.session_id,
                    endpoint: self.local_endpoint.clone(),
                })
                .clone()
        };
        let _ = self
            .signal_for_peer_queue
            .handle(SignalMessage::answer(local));
        self.emit_local_candidates();

        self.attach_candidate_handler();
        self.complete_connection();
        Ok(())
    }

    fn emit_local_candidates(&self) {
        let _ = self
            .signal_for_peer_queue
            .handle(SignalMessage::candidate(Candidate {
                endpoint: self.local_endpoint.clone(),
                priority: HOST_CANDIDATE_PRIORITY,
            }));
        let _ = self
            .signal_for_peer_queue
            .handle(SignalMessage::no_more_candidates());
    }

    /// Drain buffered candidates, keeping the highest-priority one as the
    /// remote address.
    fn attach_candidate_handler(&self) {
        if self.from_peer_candidate_queue.is_handling() {
            return;
        }
        let slot = Arc::clone(&self.remote_candidate);
        self.from_peer_candidate_queue.set_handler(move |candidate| {
            let mut best = slot.lock();
            let better = best
                .as_ref()
                .map(|b| candidate.priority > b.priority)
                .unwrap_or(true);
            if better {
                *best = Some(candidate);
            }
        });
    }

    fn complete_connection(&self) {
        let ready =
            self.local_description.lock().is_some() && self.remote_description.lock().is_some();
        if ready {
            self.set_state(State::Connected);
            info!(peer = %self.peer_name, "connected");
        }
    }

    /// Open a new labelled channel toward the peer. The channel is usable
    /// for sends immediately; `once_opened` resolves when the peer
    /// acknowledges it.
    pub fn open_data_channel(&self, label: &str) -> Result<Arc<DataChannel>> {
        match self.state() {
            State::Connecting | State::Connected => {}
            _ => return Err(Error::transport("connection is not open")),
        }
        if label.is_empty() || label.len() > 255 {
            return Err(Error::protocol(format!(
                "channel label length out of range: {}",
                label.len()
            )));
        }

        let channel = self.insert_channel(label, State::Connecting)?;
        let _ = self.outbound_frames.handle(Frame::open(label));
        Ok(channel)
    }

    fn insert_channel(&self, label: &str, initial: State) -> Result<Arc<DataChannel>> {
        let flow_id = self.next_flow_id.fetch_add(1, Ordering::Relaxed);
        let channel = {
            let mut channels = self.channels.lock();
            if channels.contains_key(label) {
                return Err(Error::DuplicateLabel(label.to_string()));
            }
            let channel = DataChannel::new(
                label.to_string(),
                initial,
                Arc::clone(&self.outbound_frames),
                Arc::clone(&self.aqm),
                flow_id,
            );
            channels.insert(label.to_string(), Arc::clone(&channel));
            channel
        };

        // Drop the map entry once the channel closes, whichever side closed
        // it.
        let channels = Arc::clone(&self.channels);
        let watched = Arc::clone(&channel);
        tokio::spawn(async move {
            watched.once_closed().await;
            channels.lock().remove(watched.label());
        });

        Ok(channel)
    }

    /// Process one frame that arrived off the wire.
    pub fn handle_frame(&self, frame: Frame) -> Result<()> {
        if self.state() == State::Disconnected {
            return Err(Error::transport("frame received after disconnect"));
        }

        match frame.frame_type {
            FrameType::ChannelOpen => {
                let channel = self.insert_channel(&frame.label, State::Connected)?;
                let _ = self.outbound_frames.handle(Frame::open_ack(&frame.label));
                let _ = self.peer_opened_channel_queue.handle(channel);
                Ok(())
            }
            FrameType::ChannelOpenAck => {
                let channel = self.channels.lock().get(&frame.label).cloned();
                match channel {
                    Some(channel) => {
                        channel.set_state(State::Connected);
                        Ok(())
                    }
                    None => Err(Error::protocol(format!(
                        "open-ack for unknown channel {}",
                        frame.label
                    ))),
                }
            }
            FrameType::ChannelData => {
                let channel = self.channels.lock().get(&frame.label).cloned();
                match channel {
                    Some(channel) => {
                        let _ = channel.data_from_peer_queue.handle(frame.payload);
                    }
                    // Data racing a close is normal; drop it.
                    None => debug!(label = %frame.label, "data for unknown channel"),
                }
                Ok(())
            }
            FrameType::ChannelClose => {
                let channel = self.channels.lock().remove(&frame.label);
                if let Some(channel) = channel {
                    // Graceful close: data already received stays readable,
                    // so the application can drain the tail of the stream.
                    channel.set_state(State::Disconnected);
                } else {
                    debug!(label = %frame.label, "close for unknown channel");
                }
                Ok(())
            }
        }
    }

    /// Tear the connection down. Idempotent. All channels are force-closed
    /// and the connection's queues are cleared.
    pub fn close(&self) {
        if self.state() == State::Disconnected {
            return;
        }
        info!(peer = %self.peer_name, "closing connection");
        self.set_state(State::Disconnected);

        let channels: Vec<Arc<DataChannel>> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.abort();
        }
        self.from_peer_candidate_queue.clear();
        self.outbound_frames.clear();
        self.signal_for_peer_queue.clear();
    }

    fn close_with_error(&self, err: Error) {
        warn!(peer = %self.peer_name, %err, "closing with error");
        self.connect_error.lock().get_or_insert(err);
        self.close();
    }
}

fn build_aqm(policy: &AqmPolicy, outbound: Arc<EventQueue<Frame>>) -> SharedAqm {
    let fast_outbound = Arc::clone(&outbound);
    let fast = Box::new(move |frame| {
        let _ = fast_outbound.handle(frame);
    });
    let traced = Box::new(move |frame| {
        let outbound = Arc::clone(&outbound);
        Box::pin(async move {
            let _ = outbound.handle(frame).await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    });

    let aqm: Box<dyn Aqm<Frame>> = match *policy {
        AqmPolicy::Null => Box::new(Null::new(fast)),
        AqmPolicy::TailDrop { max_length } => Box::new(TailDrop::new(max_length, traced)),
        AqmPolicy::RedSentinel {
            drop_threshold,
            tracing_fraction,
        } => {
            let mut red = RedSentinel::new(drop_threshold, fast, traced);
            red.set_tracing_fraction(tracing_fraction);
            Box::new(red)
        }
    };
    Arc::new(Mutex::new(aqm))
}
