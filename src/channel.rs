//! Circuit Channel (C6).
//!
//! A thin byte-oriented façade over one circuit for an upper-layer caller —
//! generalized from the donor's `blobs.rs` thin-async-wrapper-over-core
//! shape, swapping its direct return values for an event-callback surface
//! since this façade's `receive` is driven from the exit hop rather than
//! from a caller-initiated poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;

use crate::circuit::{CircuitBuilder, CircuitStatus};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("send/receive requested on a channel that is not open")]
    NotOpen,
    #[error("operation on a closed circuit")]
    CircuitClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

type OpenCallback = Box<dyn Fn() + Send + Sync>;
type MessageCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(ChannelError) + Send + Sync>;
type CloseCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_open: Option<OpenCallback>,
    on_message: Option<MessageCallback>,
    on_error: Option<ErrorCallback>,
    on_close: Option<CloseCallback>,
}

pub struct CircuitChannel {
    builder: Arc<CircuitBuilder>,
    circuit_id: String,
    state: Mutex<ChannelState>,
    open_delivered: AtomicBool,
    close_delivered: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl CircuitChannel {
    pub fn new(builder: Arc<CircuitBuilder>, circuit_id: String) -> Arc<Self> {
        Arc::new(CircuitChannel {
            builder,
            circuit_id,
            state: Mutex::new(ChannelState::Connecting),
            open_delivered: AtomicBool::new(false),
            close_delivered: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub async fn on_open(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().await.on_open = Some(Box::new(f));
    }

    pub async fn on_message(&self, f: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.callbacks.lock().await.on_message = Some(Box::new(f));
    }

    pub async fn on_error(&self, f: impl Fn(ChannelError) + Send + Sync + 'static) {
        self.callbacks.lock().await.on_error = Some(Box::new(f));
    }

    pub async fn on_close(&self, f: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().await.on_close = Some(Box::new(f));
    }

    /// Transitions Connecting → Open iff the underlying circuit reports
    /// `Ready`; otherwise Closed. Fires `on_open` at most once.
    pub async fn connect(&self) -> ChannelState {
        let ready = self.builder.status(&self.circuit_id).await == Some(CircuitStatus::Ready);
        let mut state = self.state.lock().await;
        if ready {
            *state = ChannelState::Open;
            drop(state);
            if !self.open_delivered.swap(true, Ordering::SeqCst) {
                if let Some(cb) = &self.callbacks.lock().await.on_open {
                    cb();
                }
            }
            ChannelState::Open
        } else {
            *state = ChannelState::Closed;
            ChannelState::Closed
        }
    }

    /// Rejects unless `Open`. Caller supplies either an opaque byte
    /// sequence or UTF-8 text, already encoded to bytes by this point —
    /// see `send_text` for the text convenience.
    pub async fn send(&self, data: &[u8]) -> Result<(), ChannelError> {
        if *self.state.lock().await != ChannelState::Open {
            self.fire_error(ChannelError::NotOpen).await;
            return Err(ChannelError::NotOpen);
        }
        if self.builder.send(&self.circuit_id, data).await.is_err() {
            self.fire_error(ChannelError::CircuitClosed).await;
            return Err(ChannelError::CircuitClosed);
        }
        Ok(())
    }

    pub async fn send_text(&self, text: &str) -> Result<(), ChannelError> {
        self.send(text.as_bytes()).await
    }

    /// Invoked by the lower layer when plaintext emerges at the exit hop.
    pub async fn receive(&self, data: &[u8]) {
        if let Some(cb) = &self.callbacks.lock().await.on_message {
            cb(data);
        }
    }

    /// Idempotent; also closes the underlying circuit. Fires `on_close` at
    /// most once.
    pub async fn close(&self) {
        let already_closed = {
            let mut state = self.state.lock().await;
            let was_closed = *state == ChannelState::Closed;
            *state = ChannelState::Closed;
            was_closed
        };
        self.builder.close(&self.circuit_id).await;
        if !already_closed && !self.close_delivered.swap(true, Ordering::SeqCst) {
            if let Some(cb) = &self.callbacks.lock().await.on_close {
                cb();
            }
        }
    }

    async fn fire_error(&self, err: ChannelError) {
        if let Some(cb) = &self.callbacks.lock().await.on_error {
            cb(err);
        }
    }

    pub async fn state(&self) -> ChannelState {
        *self.state.lock().await
    }
}
