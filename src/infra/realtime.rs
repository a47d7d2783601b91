use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::infra::api::{Api, BackendError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row-level change on a watched relation. Old/new row images are
/// whatever the backend publishes; consumers that cannot use them fall
/// back to a full re-fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub table: String,
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    #[serde(default)]
    pub old: Option<Value>,
    #[serde(default)]
    pub new: Option<Value>,
}

/// Wire envelope for the realtime socket. Channels multiplex over one
/// connection, keyed by topic.
#[derive(Debug, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TableSpec {
    table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filter: Option<String>,
}

struct Inner {
    outbound: mpsc::UnboundedSender<Frame>,
    topics: Mutex<HashMap<String, broadcast::Sender<ChangeNotification>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<()>>>,
}

/// Realtime capability: one websocket, many topic-scoped subscriptions.
/// There is no reconnect policy; when the socket dies every subscription
/// ends and the consumer decides what to surface.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<Inner>,
}

impl RealtimeClient {
    pub async fn connect(api: &Api, heartbeat: Duration) -> Result<Self, BackendError> {
        let url = api.websocket_url()?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|err| BackendError::Request(format!("realtime connect failed: {}", err)))?;

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outbound,
            topics: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        });
        tokio::spawn(run_socket(socket, outbound_rx, inner.clone(), heartbeat));

        Ok(Self { inner })
    }

    pub fn channel(&self, topic: &str) -> ChannelBuilder {
        ChannelBuilder {
            client: self.clone(),
            topic: topic.to_string(),
            tables: Vec::new(),
        }
    }
}

pub struct ChannelBuilder {
    client: RealtimeClient,
    topic: String,
    tables: Vec<TableSpec>,
}

impl ChannelBuilder {
    pub fn on_table(mut self, table: &str) -> Self {
        self.tables.push(TableSpec {
            table: table.to_string(),
            filter: None,
        });
        self
    }

    /// Watch a table restricted to rows matching an equality filter,
    /// e.g. `user_id=eq.<uuid>`. The backend applies the filter.
    pub fn on_table_filtered(mut self, table: &str, filter: &str) -> Self {
        self.tables.push(TableSpec {
            table: table.to_string(),
            filter: Some(filter.to_string()),
        });
        self
    }

    /// Register the topic and wait for the backend to acknowledge it, so a
    /// change committed right after this returns cannot be missed.
    pub async fn subscribe(self) -> Result<Subscription, BackendError> {
        let (sender, receiver) = broadcast::channel(64);
        self.client
            .inner
            .topics
            .lock()
            .expect("topics lock poisoned")
            .insert(self.topic.clone(), sender);

        let (ack, acked) = oneshot::channel();
        self.client
            .inner
            .pending
            .lock()
            .expect("pending lock poisoned")
            .insert(self.topic.clone(), ack);

        let frame = Frame {
            topic: self.topic.clone(),
            event: "subscribe".to_string(),
            payload: serde_json::json!({ "tables": self.tables }),
        };
        self.client
            .inner
            .outbound
            .send(frame)
            .map_err(|_| BackendError::Request("realtime connection closed".to_string()))?;

        acked
            .await
            .map_err(|_| BackendError::Request("realtime subscription failed".to_string()))?;

        Ok(Subscription {
            topic: self.topic,
            receiver,
            client: self.client,
        })
    }
}

/// Live subscription, scoped to its consumer. Dropping it unsubscribes the
/// topic so screens cannot leak listeners across navigation.
pub struct Subscription {
    topic: String,
    receiver: broadcast::Receiver<ChangeNotification>,
    client: RealtimeClient,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next change on this topic; None once the socket is gone.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped, "realtime subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.client
            .inner
            .topics
            .lock()
            .expect("topics lock poisoned")
            .remove(&self.topic);
        let _ = self.client.inner.outbound.send(Frame {
            topic: self.topic.clone(),
            event: "unsubscribe".to_string(),
            payload: Value::Null,
        });
    }
}

async fn run_socket(
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    inner: Arc<Inner>,
    heartbeat: Duration,
) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(error = ?err, "failed to encode realtime frame");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(text)).await {
                    warn!(error = %err, "realtime send failed");
                    break;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => dispatch(&inner, &text),
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "realtime socket error");
                    break;
                }
            },
            _ = ticker.tick() => {
                let frame = Frame {
                    topic: "system".to_string(),
                    event: "heartbeat".to_string(),
                    payload: Value::Null,
                };
                if let Ok(text) = serde_json::to_string(&frame) {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // Dropping the senders ends every open subscription and fails any
    // subscribe still waiting for its acknowledgement.
    inner
        .topics
        .lock()
        .expect("topics lock poisoned")
        .clear();
    inner
        .pending
        .lock()
        .expect("pending lock poisoned")
        .clear();
    debug!("realtime socket closed");
}

fn dispatch(inner: &Inner, text: &str) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = ?err, "failed to parse realtime frame");
            return;
        }
    };

    match frame.event.as_str() {
        "change" => {
            let change: ChangeNotification = match serde_json::from_value(frame.payload) {
                Ok(change) => change,
                Err(err) => {
                    warn!(error = ?err, "failed to parse change payload");
                    return;
                }
            };
            let topics = inner.topics.lock().expect("topics lock poisoned");
            if let Some(sender) = topics.get(&frame.topic) {
                let _ = sender.send(change);
            }
        }
        "ok" => {
            if let Some(ack) = inner
                .pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&frame.topic)
            {
                let _ = ack.send(());
            }
        }
        "error" => {
            warn!(topic = %frame.topic, payload = %frame.payload, "realtime channel error");
        }
        _ => {
            debug!(event = %frame.event, "ignoring realtime frame");
        }
    }
}
