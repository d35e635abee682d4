use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{Mutex, mpsc};

use crate::http_api::AppState;
use crate::instance::{InstanceStatus, MSG_STOPPED, ServerInstance};
use crate::live_events::{EventCategory, LiveEvent};
use crate::log_stream::LogStream;

const DEFAULT_TAIL: u32 = 200;
const MAX_TAIL: u32 = 1000;
const SUPERVISOR_INTERVAL: Duration = Duration::from_secs(2);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
/// Two consecutive unanswered pings terminate the session.
const MAX_MISSED_PONGS: u32 = 2;

const RESET: &str = "\x1b[0m";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleQuery {
    server_id: Option<String>,
    user_uuid: Option<String>,
    tail: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum InboundFrame {
    Command { command: String },
}

fn category_presentation(category: EventCategory) -> Option<(&'static str, &'static str, &'static str)> {
    match category {
        EventCategory::Status => Some(("Status", "\x1b[1;36m", "\x1b[36m")),
        EventCategory::Pull => Some(("Download", "\x1b[1;34m", "\x1b[34m")),
        EventCategory::Error => Some(("Erro", "\x1b[1;31m", "\x1b[31m")),
        EventCategory::Warn => Some(("Aviso", "\x1b[1;33m", "\x1b[33m")),
        EventCategory::Command => Some(("Comando", "\x1b[1;35m", "\x1b[35m")),
        EventCategory::Log | EventCategory::Internal => None,
    }
}

fn category_name(category: EventCategory) -> &'static str {
    match category {
        EventCategory::Status => "status",
        EventCategory::Pull => "pull",
        EventCategory::Error => "error",
        EventCategory::Warn => "warn",
        EventCategory::Command => "command",
        EventCategory::Log => "log",
        EventCategory::Internal => "internal",
    }
}

/// Outbound frame for one event. `internal` events never leave the
/// process; `log` lines are sent verbatim without a prefix.
fn event_frame(event: &LiveEvent) -> Option<String> {
    if event.category == EventCategory::Internal {
        return None;
    }

    let frame = match category_presentation(event.category) {
        Some((label, prefix_color, message_color)) => json!({
            "type": "line",
            "prefix": label,
            "category": category_name(event.category),
            "message": event.message,
            "timestamp": event.timestamp,
            "line": format!(
                "{prefix_color}{label}{RESET} {message_color}{}{RESET}",
                event.message
            ),
        }),
        None => json!({
            "type": "line",
            "category": category_name(event.category),
            "message": event.message,
            "timestamp": event.timestamp,
            "line": event.message,
        }),
    };
    serde_json::to_string(&frame).ok()
}

fn error_frame(message: &str) -> String {
    event_frame(&LiveEvent {
        category: EventCategory::Error,
        message: message.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
    .unwrap_or_default()
}

fn log_line_frame(line: &str) -> Option<String> {
    event_frame(&LiveEvent {
        category: EventCategory::Log,
        message: line.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    })
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<ConsoleQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(state, query, socket))
}

/// Start following container logs and forward each line as a console
/// frame. The stream handle is enough for cleanup: aborting it closes the
/// line channel, which ends the forwarding task.
fn spawn_log_stream(
    instance: &Arc<ServerInstance>,
    tail: u32,
    tx: mpsc::Sender<Message>,
) -> LogStream {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel();
    let stream = instance.stream_logs(tail, line_tx);
    tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            let Some(frame) = log_line_frame(&line) else {
                continue;
            };
            if tx.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });
    stream
}

async fn handle_session(state: AppState, query: ConsoleQuery, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(64);
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let close = |tx: mpsc::Sender<Message>| async move {
        let _ = tx.send(Message::Close(None)).await;
    };

    let (Some(server_id), Some(user_uuid)) = (
        query.server_id.as_deref().filter(|v| !v.is_empty()),
        query.user_uuid.as_deref().filter(|v| !v.is_empty()),
    ) else {
        let _ = tx
            .send(Message::Text(error_frame("serverId and userUuid are required")))
            .await;
        close(tx).await;
        let _ = writer.await;
        return;
    };
    let tail = query.tail.unwrap_or(DEFAULT_TAIL).min(MAX_TAIL);

    let Some(instance) = state.registry.get(server_id).await else {
        let _ = tx
            .send(Message::Text(error_frame("unknown server")))
            .await;
        close(tx).await;
        let _ = writer.await;
        return;
    };

    if !state.remote.has_permission(user_uuid, server_id).await {
        let _ = tx
            .send(Message::Text(error_frame("permission denied")))
            .await;
        close(tx).await;
        let _ = writer.await;
        return;
    }

    // From here on the session is live: events flow out, commands flow in,
    // and the supervisor keeps the log stream glued to the container state.
    let (subscription, mut events) = instance.subscribe();

    let forward = {
        let tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(frame) = event_frame(&event) else {
                    continue;
                };
                if tx.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
        })
    };

    let log_slot: Arc<Mutex<Option<LogStream>>> = Arc::new(Mutex::new(None));

    let initial = instance.status().await;
    if initial == InstanceStatus::Running {
        let stream = spawn_log_stream(&instance, tail, tx.clone());
        *log_slot.lock().await = Some(stream);
    } else if let Some(frame) = event_frame(&LiveEvent {
        category: EventCategory::Status,
        message: MSG_STOPPED.to_string(),
        timestamp: chrono::Utc::now().timestamp_millis(),
    }) {
        let _ = tx.send(Message::Text(frame)).await;
    }

    let supervisor = {
        let instance = instance.clone();
        let log_slot = log_slot.clone();
        let tx = tx.clone();
        let mut last = initial;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SUPERVISOR_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let current = instance.status().await;
                if current == last {
                    continue;
                }
                match current {
                    InstanceStatus::Running => {
                        let stream = spawn_log_stream(&instance, 0, tx.clone());
                        if let Some(old) = log_slot.lock().await.replace(stream) {
                            old.stop();
                        }
                    }
                    InstanceStatus::Stopped => {
                        if let Some(stream) = log_slot.lock().await.take() {
                            stream.stop();
                        }
                    }
                }
                last = current;
            }
        })
    };

    let missed_pongs = Arc::new(AtomicU32::new(0));
    let terminate = Arc::new(tokio::sync::Notify::new());
    let heartbeat = {
        let tx = tx.clone();
        let missed = missed_pongs.clone();
        let terminate = terminate.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if missed.fetch_add(1, Ordering::SeqCst) + 1 > MAX_MISSED_PONGS {
                    terminate.notify_one();
                    break;
                }
                if tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        })
    };

    loop {
        tokio::select! {
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<InboundFrame>(&text) {
                            Ok(InboundFrame::Command { command }) => {
                                instance.emit(EventCategory::Command, command.clone());
                                if let Err(err) = instance.send_command(&command).await {
                                    let _ = tx
                                        .send(Message::Text(error_frame(&err.to_string())))
                                        .await;
                                }
                            }
                            Err(_) => {
                                let _ = tx
                                    .send(Message::Text(error_frame("malformed frame")))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        missed_pongs.store(0, Ordering::SeqCst);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = terminate.notified() => {
                tracing::debug!(server = %instance.id(), "console heartbeat timed out");
                break;
            }
        }
    }

    // Every exit path lands here; each cleanup is idempotent.
    supervisor.abort();
    heartbeat.abort();
    forward.abort();
    if let Some(stream) = log_slot.lock().await.take() {
        stream.stop();
    }
    drop(subscription);
    close(tx).await;
    let _ = writer.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(category: EventCategory, message: &str) -> LiveEvent {
        LiveEvent {
            category,
            message: message.to_string(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn internal_events_never_leave_the_process() {
        assert!(event_frame(&event(EventCategory::Internal, "secret")).is_none());
    }

    #[test]
    fn log_events_are_sent_verbatim_without_prefix() {
        let frame = event_frame(&event(EventCategory::Log, "[12:00] joined")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "line");
        assert_eq!(value["category"], "log");
        assert_eq!(value["line"], "[12:00] joined");
        assert!(value.get("prefix").is_none());
    }

    #[test]
    fn status_events_are_colorized_with_their_prefix() {
        let frame = event_frame(&event(EventCategory::Status, "Servidor em execução.")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["prefix"], "Status");
        assert_eq!(value["category"], "status");
        let line = value["line"].as_str().unwrap();
        assert!(line.contains("\x1b[1;36mStatus\x1b[0m"));
        assert!(line.contains("Servidor em execução."));
    }

    #[test]
    fn inbound_command_frames_parse() {
        let frame: InboundFrame =
            serde_json::from_str(r#"{"type":"command","command":"say hi"}"#).unwrap();
        let InboundFrame::Command { command } = frame;
        assert_eq!(command, "say hi");
    }
}
