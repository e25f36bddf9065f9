//! Circuit Monitor (C5).
//!
//! Runs one polling loop per circuit, evaluating hop health against the
//! Peer Registry each tick and delegating repair/rebuild decisions to the
//! Circuit Builder.
//!
//! Grounded in the donor's `projector.rs` `run_projector`/`project_tick`
//! shape: a `tokio::time::interval` loop that logs and continues on a
//! per-tick error rather than aborting the loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::circuit::{CircuitBuilder, CircuitStatus};
use crate::config::CoreConfig;
use crate::identity::PeerId;
use crate::registry::PeerRegistry;
use crate::wire::PeerStatus;

#[derive(Debug, Clone)]
pub struct HealthDetails {
    pub total_hops: usize,
    pub healthy_hops: usize,
    pub average_latency_ms: f64,
    pub min_bandwidth_bps: f64,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Waiting,
    Ready { details: HealthDetails },
    Repairing { details: HealthDetails },
    Rebuilding { details: HealthDetails },
    Failed,
}

pub struct CircuitMonitor {
    registry: Arc<PeerRegistry>,
    builder: Arc<CircuitBuilder>,
    config: CoreConfig,
    events_tx: broadcast::Sender<(String, MonitorEvent)>,
}

impl CircuitMonitor {
    pub fn new(registry: Arc<PeerRegistry>, builder: Arc<CircuitBuilder>, config: CoreConfig) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(128);
        Arc::new(CircuitMonitor { registry, builder, config, events_tx })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, MonitorEvent)> {
        self.events_tx.subscribe()
    }

    /// Polls `circuit_id` every `monitor_interval_ms` until the circuit is
    /// removed from the builder's table (closed or failed and dropped).
    pub fn spawn(self: &Arc<Self>, circuit_id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(this.config.monitor_interval_ms));
            loop {
                interval.tick().await;
                if this.builder.status(&circuit_id).await.is_none() {
                    return;
                }
                if let Err(err) = this.tick(&circuit_id).await {
                    log::warn!("[monitor] tick failed for {circuit_id}: {err}");
                }
            }
        });
    }

    /// One evaluation cycle per §4.5. Returns an error only for conditions
    /// that prevented evaluation itself (not for an unhealthy circuit,
    /// which is a normal outcome reported via an emitted event).
    pub async fn tick(&self, circuit_id: &str) -> Result<(), String> {
        let Some(hops) = self.builder.hops_of(circuit_id).await else {
            return Err("unknown circuit".to_string());
        };
        let n = hops.len();

        if self.registry.available_count().await < self.config.min_nodes_required {
            self.emit(circuit_id, MonitorEvent::Waiting);
            return Ok(());
        }

        let mut healthy_latencies = Vec::new();
        let mut healthy_bandwidths = Vec::new();
        let mut unhealthy: Vec<PeerId> = Vec::new();

        for hop in &hops {
            match self.registry.get_peer(hop.peer_id).await {
                Some(entry) if entry.effective_status() == PeerStatus::Available => {
                    match self.registry.validate(hop.peer_id).await {
                        Ok(true) => {
                            healthy_latencies.push(entry.capabilities.latency_ms);
                            healthy_bandwidths.push(entry.capabilities.max_bandwidth_bps);
                        }
                        _ => unhealthy.push(hop.peer_id),
                    }
                }
                _ => unhealthy.push(hop.peer_id),
            }
        }

        let healthy_count = n - unhealthy.len();
        let details = HealthDetails {
            total_hops: n,
            healthy_hops: healthy_count,
            average_latency_ms: average(&healthy_latencies),
            min_bandwidth_bps: healthy_bandwidths.iter().cloned().fold(f64::INFINITY, f64::min),
        };

        let threshold = n / 3;

        if unhealthy.is_empty() {
            self.builder.set_status(circuit_id, CircuitStatus::Ready).await;
            self.emit(circuit_id, MonitorEvent::Ready { details });
            return Ok(());
        }

        if unhealthy.len() > threshold {
            self.builder.set_status(circuit_id, CircuitStatus::Rebuilding).await;
            self.emit(circuit_id, MonitorEvent::Rebuilding { details: details.clone() });
            match self.builder.build(n, &unhealthy).await {
                Ok(new_circuit_id) => {
                    self.builder.close(circuit_id).await;
                    log::info!("[monitor] rebuilt {circuit_id} as {new_circuit_id}");
                    self.emit(circuit_id, MonitorEvent::Ready { details });
                }
                Err(err) => {
                    self.builder.set_status(circuit_id, CircuitStatus::Failed).await;
                    log::error!("[monitor] rebuild of {circuit_id} failed: {err}");
                    self.emit(circuit_id, MonitorEvent::Failed);
                }
            }
            return Ok(());
        }

        self.builder.set_status(circuit_id, CircuitStatus::Repairing).await;
        self.emit(circuit_id, MonitorEvent::Repairing { details: details.clone() });

        for hop in &hops {
            if !unhealthy.contains(&hop.peer_id) {
                continue;
            }
            let Some(index) = hops.iter().position(|h| h.peer_id == hop.peer_id) else { continue };
            if let Err(err) = self.builder.replace_hop(circuit_id, index).await {
                log::warn!("[monitor] no replacement for hop {index} of {circuit_id}: {err}");
                self.builder.set_status(circuit_id, CircuitStatus::Rebuilding).await;
                self.emit(circuit_id, MonitorEvent::Rebuilding { details: details.clone() });
                match self.builder.build(n, &unhealthy).await {
                    Ok(new_circuit_id) => {
                        self.builder.close(circuit_id).await;
                        log::info!("[monitor] escalated rebuild of {circuit_id} as {new_circuit_id}");
                    }
                    Err(build_err) => {
                        self.builder.set_status(circuit_id, CircuitStatus::Failed).await;
                        log::error!("[monitor] escalated rebuild of {circuit_id} failed: {build_err}");
                        self.emit(circuit_id, MonitorEvent::Failed);
                        return Ok(());
                    }
                }
                self.emit(circuit_id, MonitorEvent::Ready { details });
                return Ok(());
            }
        }

        self.builder.set_status(circuit_id, CircuitStatus::Ready).await;
        self.emit(circuit_id, MonitorEvent::Ready { details });
        Ok(())
    }

    fn emit(&self, circuit_id: &str, event: MonitorEvent) {
        let _ = self.events_tx.send((circuit_id.to_string(), event));
    }
}

fn average(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
