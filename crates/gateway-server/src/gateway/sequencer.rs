//! Per-connection outbound queue
//!
//! Every event pushed through an [`OutboundQueue`] gets the connection's next
//! `seq` under the same lock that enqueues it, so the order frames reach the
//! socket is the order seqs were assigned. The queue tracks bytes handed to it
//! but not yet taken by the writer. Crossing `max_buffered` sheds the
//! connection: no more frames are accepted, and the writer skips whatever is
//! still queued, sends a best-effort `shutdown` event, and closes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cp_protocol::{
    encode, events, EventFrame, GatewayFrame, RequestFrame, ResponseFrame, ShutdownEvent, StateVersion,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::warn;

use crate::error::close_codes;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection is closing")]
    Closed,
    #[error("outbound buffer exceeded {max} bytes")]
    Overflow { max: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub code: u16,
    pub reason: String,
}

/// What the transport writer should do next
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    /// Send `farewell` (if any) and then the close frame
    Close {
        farewell: Option<String>,
        frame: CloseFrame,
    },
}

enum Item {
    Frame(String),
    Close(CloseFrame),
}

struct Shed {
    farewell: Option<String>,
    frame: CloseFrame,
}

struct QueueState {
    next_seq: u64,
    closed: bool,
    shed: Option<Shed>,
}

struct QueueShared {
    state: Mutex<QueueState>,
    buffered: AtomicUsize,
    max_buffered: usize,
    shed_signal: Notify,
    closed_signal: Notify,
}

impl QueueShared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Clone)]
pub struct OutboundQueue {
    shared: Arc<QueueShared>,
    tx: mpsc::UnboundedSender<Item>,
}

pub struct OutboundReceiver {
    shared: Arc<QueueShared>,
    rx: mpsc::UnboundedReceiver<Item>,
    finished: bool,
}

/// Create a queue capped at `max_buffered` bytes
pub fn channel(max_buffered: usize) -> (OutboundQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(QueueShared {
        state: Mutex::new(QueueState {
            next_seq: 1,
            closed: false,
            shed: None,
        }),
        buffered: AtomicUsize::new(0),
        max_buffered,
        shed_signal: Notify::new(),
        closed_signal: Notify::new(),
    });
    (
        OutboundQueue {
            shared: Arc::clone(&shared),
            tx,
        },
        OutboundReceiver {
            shared,
            rx,
            finished: false,
        },
    )
}

impl OutboundQueue {
    /// Enqueue a sequenced event. Returns the seq it was given.
    pub fn send_event(&self, event: &str, payload: Value, state_version: StateVersion) -> Result<u64, QueueError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let seq = state.next_seq;
        let text = encode(&GatewayFrame::Event(EventFrame {
            event: event.to_string(),
            payload: Some(payload),
            seq: Some(seq),
            state_version: Some(state_version),
        }))?;
        self.push_locked(&mut state, text)?;
        state.next_seq = seq.saturating_add(1);
        Ok(seq)
    }

    /// Pre-handshake events (`connect.challenge`) carry no seq
    pub fn send_unsequenced(&self, frame: EventFrame) -> Result<(), QueueError> {
        self.send_frame(&GatewayFrame::Event(frame))
    }

    pub fn send_response(&self, response: ResponseFrame) -> Result<(), QueueError> {
        self.send_frame(&GatewayFrame::Response(response))
    }

    pub fn send_request(&self, request: RequestFrame) -> Result<(), QueueError> {
        self.send_frame(&GatewayFrame::Request(request))
    }

    fn send_frame(&self, frame: &GatewayFrame) -> Result<(), QueueError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        let text = encode(frame)?;
        self.push_locked(&mut state, text)
    }

    fn push_locked(&self, state: &mut QueueState, text: String) -> Result<(), QueueError> {
        let size = text.len();
        let buffered = self.shared.buffered.load(Ordering::Acquire);
        if buffered.saturating_add(size) > self.shared.max_buffered {
            warn!(
                buffered,
                frame = size,
                max = self.shared.max_buffered,
                "Outbound buffer full; shedding slow consumer"
            );
            self.shed_locked(state, close_codes::POLICY_VIOLATION, "slow consumer");
            return Err(QueueError::Overflow {
                max: self.shared.max_buffered,
            });
        }

        self.shared.buffered.fetch_add(size, Ordering::AcqRel);
        if self.tx.send(Item::Frame(text)).is_err() {
            self.shared.buffered.fetch_sub(size, Ordering::AcqRel);
            self.mark_closed_locked(state);
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    fn shed_locked(&self, state: &mut QueueState, code: u16, reason: &str) {
        let farewell = encode(&GatewayFrame::Event(EventFrame {
            event: events::SHUTDOWN.to_string(),
            payload: serde_json::to_value(ShutdownEvent {
                reason: reason.to_string(),
                restart_expected_ms: None,
            })
            .ok(),
            seq: Some(state.next_seq),
            state_version: None,
        }))
        .ok();
        if farewell.is_some() {
            state.next_seq = state.next_seq.saturating_add(1);
        }
        state.shed = Some(Shed {
            farewell,
            frame: CloseFrame {
                code,
                reason: reason.to_string(),
            },
        });
        self.mark_closed_locked(state);
        self.shared.shed_signal.notify_one();
    }

    fn mark_closed_locked(&self, state: &mut QueueState) {
        if !state.closed {
            state.closed = true;
            self.shared.closed_signal.notify_waiters();
        }
    }

    /// Close after everything already queued has been written
    pub fn close(&self, code: u16, reason: &str) {
        let mut state = self.shared.lock();
        if state.closed {
            return;
        }
        let _ = self.tx.send(Item::Close(CloseFrame {
            code,
            reason: reason.to_string(),
        }));
        self.mark_closed_locked(&mut state);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    /// Resolves once the queue stops accepting frames
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.shared.closed_signal.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub fn buffered_bytes(&self) -> usize {
        self.shared.buffered.load(Ordering::Acquire)
    }
}

impl OutboundReceiver {
    /// Next thing to write; `None` after a close or once every sender is gone
    pub async fn next(&mut self) -> Option<Outbound> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(shed) = self.take_shed() {
                self.finished = true;
                self.rx.close();
                return Some(Outbound::Close {
                    farewell: shed.farewell,
                    frame: shed.frame,
                });
            }

            tokio::select! {
                biased;
                _ = self.shared.shed_signal.notified() => continue,
                item = self.rx.recv() => {
                    return match item? {
                        Item::Frame(text) => {
                            self.shared.buffered.fetch_sub(text.len(), Ordering::AcqRel);
                            Some(Outbound::Frame(text))
                        }
                        Item::Close(frame) => {
                            self.finished = true;
                            Some(Outbound::Close { farewell: None, frame })
                        }
                    };
                }
            }
        }
    }

    fn take_shed(&self) -> Option<Shed> {
        self.shared.lock().shed.take()
    }
}
