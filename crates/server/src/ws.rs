//! WebSocket hub.
//!
//! Clients subscribe to topics (`experiment:<id>`, `metrics:<id>`,
//! `agents`, `tasks`, `global`) with `{"type":"subscribe","topic":...}`
//! frames. Bus events matching a subscription are serialized and pushed
//! through a per-connection bounded queue; a connection that cannot keep
//! up is closed (drop counted). Pings go out every 30 s and a connection
//! with no inbound traffic for 90 s is closed.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use phoenix_bus::DomainEvent;

use crate::state::AppState;

/// Outbound frames buffered per connection before the close policy fires.
const OUTBOUND_QUEUE: usize = 64;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
}

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(socket: WebSocket, state: Arc<AppState>) {
    state.ws_metrics.connections.fetch_add(1, Ordering::Relaxed);
    state.ws_metrics.open.fetch_add(1, Ordering::Relaxed);

    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    // Writer: the only task holding the sink.
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Reader: maintains the subscription set and the idle clock.
    let subscriptions = Arc::new(std::sync::RwLock::new(HashSet::<String>::new()));
    let (seen_tx, mut seen_rx) = mpsc::channel::<()>(1);
    let reader_subs = subscriptions.clone();
    let reader = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            let _ = seen_tx.try_send(());
            match message {
                Message::Text(text) => {
                    match serde_json::from_str::<InboundFrame>(text.as_str()) {
                        Ok(InboundFrame::Subscribe { topic }) => {
                            debug!(topic, "ws subscribe");
                            write_subs(&reader_subs).insert(topic);
                        }
                        Ok(InboundFrame::Unsubscribe { topic }) => {
                            write_subs(&reader_subs).remove(&topic);
                        }
                        Err(_) => {} // unknown frames are ignored
                    }
                }
                Message::Close(_) => break,
                // Pongs and pings only feed the idle clock.
                _ => {}
            }
        }
    });

    // Pump: bus events -> outbound queue, plus pings and the idle check.
    let mut bus = state.bus.subscribe_all();
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // immediate first tick

    let mut last_seen = tokio::time::Instant::now();
    let pump_state = state.clone();
    let pump = async {
        loop {
            tokio::select! {
                event = bus.recv() => {
                    let Some(event) = event else { break };
                    if !is_subscribed(&subscriptions, &event) {
                        continue;
                    }
                    if out_tx.try_send(event.to_frame_json()).is_err() {
                        // Back-pressure policy: drop the connection, not
                        // arbitrary frames from the middle of the stream.
                        pump_state
                            .ws_metrics
                            .dropped_frames
                            .fetch_add(1, Ordering::Relaxed);
                        pump_state
                            .ws_metrics
                            .closed_backpressure
                            .fetch_add(1, Ordering::Relaxed);
                        info!("ws connection closed: outbound queue full");
                        break;
                    }
                }
                _ = ping.tick() => {
                    if last_seen.elapsed() >= IDLE_TIMEOUT {
                        info!("ws connection closed: idle");
                        break;
                    }
                    let heartbeat = serde_json::json!({
                        "type": "heartbeat",
                        "data": null,
                        "timestamp": Utc::now(),
                    });
                    if out_tx.try_send(heartbeat.to_string()).is_err() {
                        break;
                    }
                }
                seen = seen_rx.recv() => {
                    if seen.is_none() {
                        break; // reader gone: client hung up
                    }
                    last_seen = tokio::time::Instant::now();
                }
            }
        }
    };

    pump.await;
    reader.abort();
    writer.abort();
    state.ws_metrics.open.fetch_sub(1, Ordering::Relaxed);
}

fn write_subs(
    subs: &std::sync::RwLock<HashSet<String>>,
) -> std::sync::RwLockWriteGuard<'_, HashSet<String>> {
    match subs.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Does the connection's subscription set cover this event?
/// `global` covers everything.
fn is_subscribed(subs: &std::sync::RwLock<HashSet<String>>, event: &DomainEvent) -> bool {
    let subs = match subs.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if subs.contains("global") {
        return true;
    }
    event_topics(event).iter().any(|t| subs.contains(t))
}

/// Topic strings an event is delivered under (besides `global`).
fn event_topics(event: &DomainEvent) -> Vec<String> {
    match event {
        DomainEvent::ExperimentUpdate { experiment_id, .. } => {
            vec![format!("experiment:{experiment_id}")]
        }
        DomainEvent::KpiUpdate { experiment_id, .. } => {
            vec![format!("metrics:{experiment_id}")]
        }
        DomainEvent::AgentStatus { .. } => vec!["agents".to_string()],
        DomainEvent::TaskEnqueued { .. } => vec!["tasks".to_string()],
        DomainEvent::TaskStatusChanged { experiment_id, .. } => {
            let mut topics = vec!["tasks".to_string()];
            if let Some(id) = experiment_id {
                topics.push(format!("experiment:{id}"));
            }
            topics
        }
        DomainEvent::Notification { .. } => Vec::new(),
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use phoenix_core::{Liveness, Phase, TaskStatus};
    use uuid::Uuid;

    fn subs(topics: &[&str]) -> std::sync::RwLock<HashSet<String>> {
        std::sync::RwLock::new(topics.iter().map(|t| t.to_string()).collect())
    }

    #[test]
    fn test_global_covers_everything() {
        let subs = subs(&["global"]);
        let event = DomainEvent::AgentStatus {
            host_id: "h1".into(),
            liveness: Liveness::Offline,
        };
        assert!(is_subscribed(&subs, &event));
    }

    #[test]
    fn test_experiment_topic_scoping() {
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        let subs = subs(&[&format!("experiment:{id}")]);

        let mine = DomainEvent::ExperimentUpdate {
            experiment_id: id,
            phase: Phase::Failed,
            reason: "criteria not met".into(),
        };
        let theirs = DomainEvent::ExperimentUpdate {
            experiment_id: other,
            phase: Phase::Running,
            reason: "warm-up elapsed".into(),
        };
        assert!(is_subscribed(&subs, &mine));
        assert!(!is_subscribed(&subs, &theirs));
    }

    #[test]
    fn test_task_events_reach_experiment_subscribers() {
        let id = Uuid::new_v4();
        let subs = subs(&[&format!("experiment:{id}")]);
        let event = DomainEvent::TaskStatusChanged {
            task_id: Uuid::new_v4(),
            host_id: "h1".into(),
            experiment_id: Some(id),
            status: TaskStatus::Completed,
        };
        assert!(is_subscribed(&subs, &event));
    }

    #[test]
    fn test_unsubscribed_connection_gets_nothing() {
        let subs = subs(&[]);
        let event = DomainEvent::TaskEnqueued {
            task_id: Uuid::new_v4(),
            host_id: "h1".into(),
            priority: 10,
        };
        assert!(!is_subscribed(&subs, &event));
    }

    #[test]
    fn test_inbound_frame_parsing() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"subscribe","topic":"agents"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::Subscribe { topic } if topic == "agents"));

        assert!(serde_json::from_str::<InboundFrame>(r#"{"type":"launch_missiles"}"#).is_err());
    }
}
