use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

/// Client → server message envelope. The type is matched as a string so an
/// unknown type yields an `error` reply instead of a parse failure.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "connection_established")]
    ConnectionEstablished { connection_id: String },
    #[serde(rename = "pong")]
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    #[serde(rename = "authenticated")]
    Authenticated { user_id: String },
    #[serde(rename = "unauthorized")]
    Unauthorized { reason: String },
    #[serde(rename = "subscribed")]
    Subscribed {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
    #[serde(rename = "task_update")]
    TaskUpdate {
        task_id: String,
        task: serde_json::Value,
    },
    #[serde(rename = "new_message")]
    NewMessage {
        task_id: String,
        message: serde_json::Value,
    },
    #[serde(rename = "agent_status")]
    AgentStatus {
        agent: String,
        status: String,
        details: serde_json::Value,
    },
    #[serde(rename = "notification")]
    Notification { title: String, body: serde_json::Value },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        correlation_id: Option<String>,
    },
}

/// `"<resource_type>"` or `"<resource_type>:<resource_id>"`.
pub fn topic_name(resource_type: &str, resource_id: Option<&str>) -> String {
    match resource_id {
        Some(id) => format!("{}:{}", resource_type, id),
        None => resource_type.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Connection manager
// ---------------------------------------------------------------------------

struct ConnectionEntry {
    tx: mpsc::UnboundedSender<ServerEvent>,
    user_id: Option<String>,
    authenticated: bool,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct Tables {
    connections: HashMap<String, ConnectionEntry>,
    // topic → subscriber connection ids
    topics: HashMap<String, HashSet<String>>,
    // user id → owned connection ids
    users: HashMap<String, HashSet<String>>,
}

/// Tracks live client connections and their per-user / per-topic
/// subscriptions. All tables live behind one mutex; outbound frames go
/// through each connection's unbounded channel so no send ever awaits
/// while the lock is held.
pub struct ConnectionManager {
    inner: Mutex<Tables>,
    stale_after: Duration,
}

impl ConnectionManager {
    pub fn new(stale_after_secs: i64) -> Self {
        Self {
            inner: Mutex::new(Tables::default()),
            stale_after: Duration::seconds(stale_after_secs),
        }
    }

    /// Register a connection and acknowledge it. Returns the allocated id.
    pub fn connect(
        &self,
        tx: mpsc::UnboundedSender<ServerEvent>,
        user_id: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        {
            let mut tables = self.inner.lock().unwrap();
            if let Some(ref uid) = user_id {
                tables.users.entry(uid.clone()).or_default().insert(id.clone());
            }
            tables.connections.insert(
                id.clone(),
                ConnectionEntry {
                    tx,
                    authenticated: user_id.is_some(),
                    user_id,
                    connected_at: now,
                    last_activity: now,
                    topics: HashSet::new(),
                },
            );
        }
        self.send_personal(
            &id,
            ServerEvent::ConnectionEstablished {
                connection_id: id.clone(),
            },
        );
        id
    }

    /// Remove a connection from every index. Idempotent.
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let Some(entry) = tables.connections.remove(connection_id) else {
            return false;
        };
        for topic in &entry.topics {
            if let Some(subs) = tables.topics.get_mut(topic) {
                subs.remove(connection_id);
                if subs.is_empty() {
                    tables.topics.remove(topic);
                }
            }
        }
        if let Some(ref uid) = entry.user_id {
            if let Some(conns) = tables.users.get_mut(uid) {
                conns.remove(connection_id);
                if conns.is_empty() {
                    tables.users.remove(uid);
                }
            }
        }
        true
    }

    /// Attach a user identity to an already-open connection.
    pub fn authenticate(&self, connection_id: &str, user_id: &str) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let Some(entry) = tables.connections.get_mut(connection_id) else {
            return false;
        };
        // Re-authentication moves the connection between user buckets.
        let previous = entry.user_id.replace(user_id.to_string());
        entry.authenticated = true;
        if let Some(prev) = previous {
            if let Some(conns) = tables.users.get_mut(&prev) {
                conns.remove(connection_id);
                if conns.is_empty() {
                    tables.users.remove(&prev);
                }
            }
        }
        tables
            .users
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    /// Duplicate subscribe is a no-op (set semantics).
    pub fn subscribe(&self, connection_id: &str, topic: &str) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let Some(entry) = tables.connections.get_mut(connection_id) else {
            return false;
        };
        entry.topics.insert(topic.to_string());
        tables
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(connection_id.to_string());
        true
    }

    pub fn unsubscribe(&self, connection_id: &str, topic: &str) -> bool {
        let mut tables = self.inner.lock().unwrap();
        let Some(entry) = tables.connections.get_mut(connection_id) else {
            return false;
        };
        entry.topics.remove(topic);
        if let Some(subs) = tables.topics.get_mut(topic) {
            subs.remove(connection_id);
            if subs.is_empty() {
                tables.topics.remove(topic);
            }
        }
        true
    }

    pub fn touch(&self, connection_id: &str) {
        let mut tables = self.inner.lock().unwrap();
        if let Some(entry) = tables.connections.get_mut(connection_id) {
            entry.last_activity = Utc::now();
        }
    }

    /// Send to one connection. A dead channel means the receiving task is
    /// gone, so the connection is removed on the spot (self-healing).
    pub fn send_personal(&self, connection_id: &str, event: ServerEvent) -> bool {
        let failed = {
            let tables = self.inner.lock().unwrap();
            match tables.connections.get(connection_id) {
                Some(entry) => entry.tx.send(event).is_err(),
                None => return false,
            }
        };
        if failed {
            tracing::debug!(connection_id, "outbound channel closed, dropping connection");
            self.disconnect(connection_id);
            return false;
        }
        true
    }

    pub fn send_to_user(&self, user_id: &str, event: ServerEvent) -> usize {
        let targets: Vec<String> = {
            let tables = self.inner.lock().unwrap();
            tables
                .users
                .get(user_id)
                .map(|conns| conns.iter().cloned().collect())
                .unwrap_or_default()
        };
        targets
            .iter()
            .filter(|id| self.send_personal(id, event.clone()))
            .count()
    }

    pub fn broadcast_to_topic(
        &self,
        topic: &str,
        event: ServerEvent,
        exclude: Option<&str>,
    ) -> usize {
        let targets: Vec<String> = {
            let tables = self.inner.lock().unwrap();
            tables
                .topics
                .get(topic)
                .map(|subs| {
                    subs.iter()
                        .filter(|id| Some(id.as_str()) != exclude)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        targets
            .iter()
            .filter(|id| self.send_personal(id, event.clone()))
            .count()
    }

    pub fn broadcast_to_all(&self, event: ServerEvent, authenticated_only: bool) -> usize {
        let targets: Vec<String> = {
            let tables = self.inner.lock().unwrap();
            tables
                .connections
                .iter()
                .filter(|(_, entry)| !authenticated_only || entry.authenticated)
                .map(|(id, _)| id.clone())
                .collect()
        };
        targets
            .iter()
            .filter(|id| self.send_personal(id, event.clone()))
            .count()
    }

    /// Disconnect connections idle longer than the stale threshold.
    /// Returns the reaped connection ids.
    pub fn reap_stale(&self) -> Vec<String> {
        let cutoff = Utc::now() - self.stale_after;
        let stale: Vec<String> = {
            let tables = self.inner.lock().unwrap();
            tables
                .connections
                .iter()
                .filter(|(_, entry)| entry.last_activity < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &stale {
            tracing::info!(connection_id = %id, "reaping stale connection");
            self.disconnect(id);
        }
        stale
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().unwrap().connections.len()
    }

    pub fn topic_subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .topics
            .get(topic)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .users
            .get(user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// Handle one inbound control message. Every outcome, including an
    /// unknown type, is a reply on the same connection; the socket only
    /// drops on transport failure.
    pub fn handle_message(&self, connection_id: &str, text: &str) {
        self.touch(connection_id);

        let envelope: ClientEnvelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => {
                self.send_personal(
                    connection_id,
                    ServerEvent::Error {
                        error: "invalid_json".to_string(),
                        details: Some(e.to_string()),
                        correlation_id: None,
                    },
                );
                return;
            }
        };

        match envelope.msg_type.as_str() {
            "ping" => {
                self.send_personal(
                    connection_id,
                    ServerEvent::Pong {
                        correlation_id: envelope.correlation_id,
                    },
                );
            }
            "authenticate" => {
                let token = envelope
                    .data
                    .get("token")
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                // Auth mechanics are out of scope: a non-empty token is the
                // opaque user id.
                if token.is_empty() {
                    self.send_personal(
                        connection_id,
                        ServerEvent::Unauthorized {
                            reason: "missing token".to_string(),
                        },
                    );
                } else {
                    self.authenticate(connection_id, token);
                    self.send_personal(
                        connection_id,
                        ServerEvent::Authenticated {
                            user_id: token.to_string(),
                        },
                    );
                }
            }
            "subscribe" | "unsubscribe" => {
                let resource_type = envelope.data.get("resource_type").and_then(|v| v.as_str());
                let resource_id = envelope.data.get("resource_id").and_then(|v| v.as_str());
                let Some(resource_type) = resource_type else {
                    self.send_personal(
                        connection_id,
                        ServerEvent::Error {
                            error: "missing_resource_type".to_string(),
                            details: None,
                            correlation_id: envelope.correlation_id,
                        },
                    );
                    return;
                };
                let topic = topic_name(resource_type, resource_id);
                if envelope.msg_type == "subscribe" {
                    self.subscribe(connection_id, &topic);
                    self.send_personal(
                        connection_id,
                        ServerEvent::Subscribed {
                            topic,
                            correlation_id: envelope.correlation_id,
                        },
                    );
                } else {
                    self.unsubscribe(connection_id, &topic);
                    self.send_personal(
                        connection_id,
                        ServerEvent::Unsubscribed {
                            topic,
                            correlation_id: envelope.correlation_id,
                        },
                    );
                }
            }
            other => {
                self.send_personal(
                    connection_id,
                    ServerEvent::Error {
                        error: "unknown_message_type".to_string(),
                        details: Some(other.to_string()),
                        correlation_id: envelope.correlation_id,
                    },
                );
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
