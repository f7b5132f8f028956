//! `axum` WebSocket upgrade handler — the concrete wire realization of the Event Hub.
//!
//! Thin by design: upgrade, send whatever initial snapshot the caller supplies,
//! then run the same upgrade/select!/heartbeat loop shape as the teacher's
//! `api/routes/downloads.rs`, except framed as JSON envelopes (spec.md §6.2) instead
//! of protobuf and backed by a per-subscriber mailbox the hub owns (see
//! [`super::Mailbox`]) rather than a shared broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::debug;

use super::{Envelope, EventHub, SubscriptionFilter};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Subscribe {
        #[serde(default)]
        events: Option<Vec<String>>,
        #[serde(default)]
        channel_id: Option<String>,
    },
    Unsubscribe,
}

/// Drives one established connection to completion. `initial_snapshot`, when
/// provided, is sent before the subscriber is registered so the client never
/// observes a gap between the snapshot and the first live event.
pub async fn handle_socket(socket: WebSocket, hub: Arc<EventHub>, initial_snapshot: Option<serde_json::Value>) {
    let (mut sender, mut receiver) = socket.split();

    if let Some(snapshot) = initial_snapshot {
        let envelope = Envelope::new(None, super::Payload::MetricsSnapshot { snapshot });
        if send_json(&mut sender, &envelope).await.is_err() {
            return;
        }
    }

    let (subscriber_id, mut mailbox) = hub.subscribe(SubscriptionFilter::default());
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut awaiting_pong = false;
    let mut pong_timeout: Option<std::pin::Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Ping) => {
                                if sender.send(Message::Text(r#"{"type":"pong"}"#.into())).await.is_err() {
                                    break;
                                }
                            }
                            Ok(ClientMessage::Subscribe { events, channel_id }) => {
                                let filter = SubscriptionFilter {
                                    channel_id,
                                    event_types: events.map(|v| v.into_iter().collect()),
                                };
                                hub.update_filter(subscriber_id, filter);
                            }
                            Ok(ClientMessage::Unsubscribe) => {
                                hub.update_filter(subscriber_id, SubscriptionFilter::default());
                            }
                            Err(err) => {
                                debug!(error = %err, "failed to decode client message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                        pong_timeout = None;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {}
                    Some(Err(err)) => {
                        debug!(error = %err, "websocket error");
                        break;
                    }
                }
            }

            envelope = mailbox.recv() => {
                match envelope {
                    Some(envelope) => {
                        if send_json(&mut sender, &envelope).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_ok() {
                    awaiting_pong = true;
                    pong_timeout = Some(Box::pin(tokio::time::sleep(PONG_TIMEOUT)));
                } else {
                    break;
                }
            }

            _ = async { pong_timeout.as_mut().unwrap().await }, if awaiting_pong && pong_timeout.is_some() => {
                debug!("client missed pong deadline, closing connection");
                break;
            }
        }
    }

    hub.unsubscribe(subscriber_id);
}

async fn send_json(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    envelope: &Envelope,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(envelope).unwrap_or_else(|_| "{}".to_string());
    sender.send(Message::Text(text.into())).await
}
