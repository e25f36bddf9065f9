//! Signaling Adapter (C2).
//!
//! A thin wrapper around an externally-provided full-duplex JSON message
//! channel (spec.md §1: the signaling transport is an out-of-scope
//! collaborator). This module owns only the adapter-level behavior spec.md
//! assigns it: dispatching `send`, fanning inbound frames out to
//! subscribers, and exponential-backoff reconnection when the transport
//! drops.
//!
//! Grounded in the donor's `NetworkCore` `OnceLock`-singleton + idempotent
//! `init_network` shape (`network.rs`) for the adapter's own lifecycle, and
//! in the pack's `tor-basic-utils::RetryDelay` for the shape of a backoff
//! loop — simplified here to spec.md's exact doubling schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::time::timeout;

use crate::wire::SignalingMessage;

const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling transport unavailable after exhausting reconnect attempts")]
    SignalingUnavailable,
    #[error("send requested while signaling is down")]
    NotConnected,
    #[error("connect attempt timed out")]
    Timeout,
}

/// The externally-provided full-duplex channel. A real implementation talks
/// to a rendezvous service; tests use an in-memory pair.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, raw: &str) -> Result<(), String>;
    /// Returns `None` once the channel is closed.
    async fn recv(&self) -> Option<String>;
}

/// Produces a fresh transport connection, called once per (re)connect
/// attempt — spec.md models reconnection as establishing a new channel
/// rather than resuming an old one.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn SignalingTransport>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connected,
    Reconnecting,
    Unavailable,
}

/// Events the adapter surfaces to interested listeners beyond ordinary
/// inbound frames — most importantly the fatal transition after the
/// reconnect cap is exhausted.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Connected,
    Reconnecting { attempt: u32 },
    Unavailable,
}

pub struct SignalingAdapter {
    connector: Arc<dyn TransportConnector>,
    endpoint: String,
    base_backoff: Duration,
    max_attempts: u32,
    transport: Mutex<Option<Arc<dyn SignalingTransport>>>,
    state: Mutex<ConnState>,
    inbound_tx: broadcast::Sender<SignalingMessage>,
    events_tx: broadcast::Sender<AdapterEvent>,
    shutting_down: AtomicBool,
}

impl SignalingAdapter {
    /// Connect for the first time. Per spec.md §4.2 this is governed by the
    /// same backoff/cap as later reconnects.
    pub async fn connect(
        connector: Arc<dyn TransportConnector>,
        endpoint: String,
        base_backoff: Duration,
        max_attempts: u32,
    ) -> Result<Arc<Self>, SignalingError> {
        let (inbound_tx, _) = broadcast::channel(256);
        let (events_tx, _) = broadcast::channel(32);

        let adapter = Arc::new(SignalingAdapter {
            connector,
            endpoint,
            base_backoff,
            max_attempts,
            transport: Mutex::new(None),
            state: Mutex::new(ConnState::Reconnecting),
            inbound_tx,
            events_tx,
            shutting_down: AtomicBool::new(false),
        });

        adapter.establish_with_backoff().await?;

        let pump_adapter = adapter.clone();
        tokio::spawn(async move {
            pump_adapter.recv_pump_loop().await;
        });

        Ok(adapter)
    }

    async fn establish_with_backoff(&self) -> Result<(), SignalingError> {
        let mut delay = self.base_backoff;
        for attempt in 1..=self.max_attempts {
            let _ = self
                .events_tx
                .send(AdapterEvent::Reconnecting { attempt });

            let attempt_result = timeout(
                HANDSHAKE_DEADLINE,
                self.connector.connect(&self.endpoint),
            )
            .await;

            match attempt_result {
                Ok(Ok(transport)) => {
                    *self.transport.lock().await = Some(transport);
                    *self.state.lock().await = ConnState::Connected;
                    let _ = self.events_tx.send(AdapterEvent::Connected);
                    return Ok(());
                }
                _ => {
                    if attempt < self.max_attempts {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        *self.state.lock().await = ConnState::Unavailable;
        let _ = self.events_tx.send(AdapterEvent::Unavailable);
        Err(SignalingError::SignalingUnavailable)
    }

    async fn recv_pump_loop(self: Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::Relaxed) {
                return;
            }
            let transport = self.transport.lock().await.clone();
            let Some(transport) = transport else {
                return;
            };
            match transport.recv().await {
                Some(raw) => {
                    if let Some(msg) = SignalingMessage::parse(&raw) {
                        let _ = self.inbound_tx.send(msg);
                    }
                    // Unrecognized/malformed frames are ignored per §6.
                }
                None => {
                    log::warn!("[signaling] transport closed, attempting reconnect");
                    *self.state.lock().await = ConnState::Reconnecting;
                    *self.transport.lock().await = None;
                    if self.establish_with_backoff().await.is_err() {
                        log::error!("[signaling] reconnect attempts exhausted");
                        return;
                    }
                }
            }
        }
    }

    /// Reject with `NotConnected` while disconnected — no local queueing;
    /// upper layers must cope (§4.2).
    pub async fn send(&self, msg: &SignalingMessage) -> Result<(), SignalingError> {
        let state = *self.state.lock().await;
        if state != ConnState::Connected {
            return Err(SignalingError::NotConnected);
        }
        let transport = self.transport.lock().await.clone();
        match transport {
            Some(t) => t
                .send(&msg.to_json())
                .await
                .map_err(|_| SignalingError::NotConnected),
            None => Err(SignalingError::NotConnected),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalingMessage> {
        self.inbound_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events_tx.subscribe()
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.lock().await == ConnState::Connected
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::mpsc;

    struct MockTransport {
        inbound: Mutex<mpsc::UnboundedReceiver<Option<String>>>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl SignalingTransport for MockTransport {
        async fn send(&self, raw: &str) -> Result<(), String> {
            self.sent.lock().await.push(raw.to_string());
            Ok(())
        }
        async fn recv(&self) -> Option<String> {
            self.inbound.lock().await.recv().await.flatten()
        }
    }

    struct AlwaysFailConnector;

    #[async_trait]
    impl TransportConnector for AlwaysFailConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn SignalingTransport>, String> {
            Err("refused".to_string())
        }
    }

    struct WorkingConnector {
        sent: Arc<Mutex<Vec<String>>>,
        tx: mpsc::UnboundedSender<Option<String>>,
        rx: Mutex<Option<mpsc::UnboundedReceiver<Option<String>>>>,
    }

    impl WorkingConnector {
        fn new() -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            WorkingConnector {
                sent: Arc::new(Mutex::new(Vec::new())),
                tx,
                rx: Mutex::new(Some(rx)),
            }
        }
    }

    #[async_trait]
    impl TransportConnector for WorkingConnector {
        async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn SignalingTransport>, String> {
            let rx = self.rx.lock().await.take().expect("connect called once in this test");
            Ok(Arc::new(MockTransport {
                inbound: Mutex::new(rx),
                sent: self.sent.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn exhausting_reconnect_attempts_is_fatal() {
        let connector = Arc::new(AlwaysFailConnector);
        let result = SignalingAdapter::connect(
            connector,
            "wss://example.invalid".into(),
            Duration::from_millis(1),
            3,
        )
        .await;
        assert!(matches!(result, Err(SignalingError::SignalingUnavailable)));
    }

    #[tokio::test]
    async fn send_while_disconnected_rejects_locally() {
        let connector = Arc::new(AlwaysFailConnector);
        let attempts = AtomicU32::new(0);
        let _ = &attempts;
        let result = SignalingAdapter::connect(
            connector,
            "wss://example.invalid".into(),
            Duration::from_millis(1),
            1,
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn connected_adapter_accepts_send() {
        let connector = Arc::new(WorkingConnector::new());
        let adapter = SignalingAdapter::connect(
            connector.clone(),
            "wss://example.invalid".into(),
            Duration::from_millis(1),
            3,
        )
        .await
        .unwrap();

        assert!(adapter.is_connected().await);

        let msg = SignalingMessage::NodePing {
            node_id: "a".into(),
            target_node_id: "b".into(),
            timestamp: 1,
        };
        adapter.send(&msg).await.unwrap();

        let sent = connector.sent.lock().await;
        assert_eq!(sent.len(), 1);
        adapter.shutdown();
    }

    #[tokio::test]
    async fn inbound_frames_are_delivered_to_subscribers() {
        let connector = Arc::new(WorkingConnector::new());
        let adapter = SignalingAdapter::connect(
            connector.clone(),
            "wss://example.invalid".into(),
            Duration::from_millis(1),
            3,
        )
        .await
        .unwrap();

        let mut sub = adapter.subscribe();
        let frame = SignalingMessage::NodePing {
            node_id: "a".into(),
            target_node_id: "b".into(),
            timestamp: 42,
        }
        .to_json();
        connector.tx.send(Some(frame)).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("did not receive in time")
            .unwrap();
        matches!(received, SignalingMessage::NodePing { .. });
        adapter.shutdown();
    }
}
