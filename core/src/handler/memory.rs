//! In-memory reference handlers
//!
//! Process-local implementations of the four stock capabilities. They back
//! the test suite and `nodehost run`; production deployments register their
//! own clients under the same names and protocols.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{Handler, HandlerError, HandlerRequest, HandlerSettings, ProtocolDescriptor};

type HandlerResult = std::result::Result<Value, HandlerError>;

fn unsupported(handler_type: &str, operation: &str) -> HandlerError {
    HandlerError::new(format!("{} does not support operation '{}'", handler_type, operation))
}

/// FSM state rows keyed by `(fsm_type, entity_id)`
///
/// `upsert` is optimistic: the stored state must equal the write's
/// `previous_state` (or the row must not exist yet).
#[derive(Default)]
pub struct InMemoryStateStore {
    rows: RwLock<HashMap<(String, String), StateRow>>,
}

#[derive(Debug, Clone)]
struct StateRow {
    state: String,
    updated_at: Value,
    version: u64,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self, fsm_type: &str, entity_id: &str) -> Option<String> {
        self.rows
            .read()
            .await
            .get(&(fsm_type.to_string(), entity_id.to_string()))
            .map(|row| row.state.clone())
    }
}

#[async_trait]
impl Handler for InMemoryStateStore {
    fn handler_type(&self) -> &str {
        "state_store"
    }

    fn protocol(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new("StateStoreProtocol", "1.0.0")
            .method("get", "{fsm_type, entity_id}", "{state: string|null, version}")
            .method("upsert", "StateUpdate", "{version}")
    }

    async fn call(&self, request: HandlerRequest) -> HandlerResult {
        let key = (
            request.str_field("fsm_type")?.to_string(),
            request.str_field("entity_id")?.to_string(),
        );
        match request.operation.as_str() {
            "get" => {
                let rows = self.rows.read().await;
                Ok(match rows.get(&key) {
                    Some(row) => json!({"state": row.state, "version": row.version, "updated_at": row.updated_at}),
                    None => json!({"state": null, "version": 0}),
                })
            }
            "upsert" => {
                let new_state = request.str_field("new_state")?.to_string();
                let previous = request.payload.get("previous_state").and_then(Value::as_str);
                let mut rows = self.rows.write().await;
                if let Some(row) = rows.get(&key) {
                    if previous != Some(row.state.as_str()) {
                        return Err(HandlerError::new(format!(
                            "stale write for {}/{}: stored {} but update expected {}",
                            key.0,
                            key.1,
                            row.state,
                            previous.unwrap_or("<none>")
                        )));
                    }
                }
                let version = rows.get(&key).map_or(1, |row| row.version + 1);
                let updated_at = request.payload.get("timestamp").cloned().unwrap_or(Value::Null);
                rows.insert(key, StateRow { state: new_state, updated_at, version });
                Ok(json!({"version": version}))
            }
            other => Err(unsupported("state_store", other)),
        }
    }
}

/// Key/value cache
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().await.get(key).cloned()
    }

    /// CACHE_WRITE intents carry no explicit key; derive one from the entity
    fn key_of(request: &HandlerRequest) -> std::result::Result<String, HandlerError> {
        if let Some(key) = request.payload.get("key").and_then(Value::as_str) {
            return Ok(key.to_string());
        }
        let fsm_type = request.str_field("fsm_type")?;
        let entity_id = request.str_field("entity_id")?;
        Ok(format!("{}:{}", fsm_type, entity_id))
    }
}

#[async_trait]
impl Handler for InMemoryCache {
    fn handler_type(&self) -> &str {
        "cache"
    }

    fn protocol(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new("CacheProtocol", "1.0.0")
            .method("get", "{key}", "{value: any|null}")
            .method("set", "{key, value} | CacheWrite", "{stored: bool}")
            .method("delete", "{key}", "{deleted: bool}")
    }

    async fn call(&self, request: HandlerRequest) -> HandlerResult {
        let key = Self::key_of(&request)?;
        match request.operation.as_str() {
            "get" => Ok(json!({"value": self.entries.read().await.get(&key).cloned()})),
            "set" => {
                let value = request.payload.get("value").cloned().unwrap_or_else(|| request.payload.clone());
                self.entries.write().await.insert(key, value);
                Ok(json!({"stored": true}))
            }
            "delete" => Ok(json!({"deleted": self.entries.write().await.remove(&key).is_some()})),
            other => Err(unsupported("cache", other)),
        }
    }
}

/// Message producer that keeps published messages in memory
#[derive(Default)]
pub struct InMemoryMessageProducer {
    published: RwLock<VecDeque<Value>>,
    default_topic: RwLock<Option<String>>,
}

impl InMemoryMessageProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<Value> {
        self.published.read().await.iter().cloned().collect()
    }
}

#[async_trait]
impl Handler for InMemoryMessageProducer {
    fn handler_type(&self) -> &str {
        "message_producer"
    }

    fn protocol(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new("MessageProducerProtocol", "1.0.0")
            .method("publish", "{topic, ...}", "{offset}")
    }

    async fn initialize(&self, settings: &HandlerSettings) -> std::result::Result<(), HandlerError> {
        if let Some(topic) = settings.get("default_topic").and_then(Value::as_str) {
            *self.default_topic.write().await = Some(topic.to_string());
        }
        Ok(())
    }

    async fn call(&self, request: HandlerRequest) -> HandlerResult {
        if request.operation != "publish" {
            return Err(unsupported("message_producer", &request.operation));
        }
        let topic = match request.payload.get("topic").and_then(Value::as_str) {
            Some(topic) => topic.to_string(),
            None => self
                .default_topic
                .read()
                .await
                .clone()
                .ok_or_else(|| HandlerError::new("publish: no topic and no default_topic configured"))?,
        };
        let mut published = self.published.write().await;
        published.push_back(json!({"topic": topic, "message": request.payload}));
        Ok(json!({"offset": published.len() - 1}))
    }
}

/// Vector store entry
#[derive(Debug, Clone)]
struct VectorEntry {
    id: String,
    embedding: Vec<f32>,
    content: Value,
}

/// Vector store with cosine similarity search
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<Vec<VectorEntry>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn embedding_of(request: &HandlerRequest) -> std::result::Result<Vec<f32>, HandlerError> {
        request
            .payload
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| HandlerError::new(format!("{}: missing 'embedding' array", request.operation)))?
            .iter()
            .map(|v| {
                v.as_f64()
                    .map(|f| f as f32)
                    .ok_or_else(|| HandlerError::new("embedding must contain only numbers"))
            })
            .collect()
    }
}

#[async_trait]
impl Handler for InMemoryVectorStore {
    fn handler_type(&self) -> &str {
        "vector_store"
    }

    fn protocol(&self) -> ProtocolDescriptor {
        ProtocolDescriptor::new("VectorStoreProtocol", "1.0.0")
            .method("upsert", "{id, embedding, content}", "{stored: bool}")
            .method("query", "{embedding, top_k}", "{matches: [{id, score, content}]}")
            .method("fetch", "{id}", "{entry: {id, content}|null}")
            .method("delete", "{id}", "{deleted: bool}")
    }

    async fn call(&self, request: HandlerRequest) -> HandlerResult {
        match request.operation.as_str() {
            "upsert" => {
                let id = request.str_field("id")?.to_string();
                let embedding = Self::embedding_of(&request)?;
                let content = request.payload.get("content").cloned().unwrap_or(Value::Null);
                let mut entries = self.entries.write().await;
                entries.retain(|e| e.id != id);
                entries.push(VectorEntry { id, embedding, content });
                Ok(json!({"stored": true}))
            }
            "query" => {
                let query = Self::embedding_of(&request)?;
                let top_k = request.payload.get("top_k").and_then(Value::as_u64).unwrap_or(5) as usize;
                let entries = self.entries.read().await;
                let mut scored: Vec<(f32, &VectorEntry)> = entries
                    .iter()
                    .map(|entry| (cosine_similarity(&query, &entry.embedding), entry))
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0));
                let matches: Vec<Value> = scored
                    .into_iter()
                    .take(top_k)
                    .map(|(score, entry)| json!({"id": entry.id, "score": score, "content": entry.content}))
                    .collect();
                Ok(json!({"matches": matches}))
            }
            "fetch" => {
                let id = request
                    .payload
                    .get("id")
                    .or_else(|| request.payload.get("entity_id"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| HandlerError::new("fetch: missing 'id'"))?;
                let entries = self.entries.read().await;
                let entry = entries
                    .iter()
                    .find(|e| e.id == id)
                    .map(|e| json!({"id": e.id, "content": e.content}));
                Ok(json!({"entry": entry}))
            }
            "delete" => {
                let id = request.str_field("id")?;
                let mut entries = self.entries.write().await;
                let before = entries.len();
                entries.retain(|e| e.id != id);
                Ok(json!({"deleted": entries.len() < before}))
            }
            other => Err(unsupported("vector_store", other)),
        }
    }
}

/// Calculate cosine similarity between two vectors
fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// The four stock handlers, ready to register
pub fn reference_handlers() -> Vec<Arc<dyn Handler>> {
    vec![
        Arc::new(InMemoryStateStore::new()),
        Arc::new(InMemoryCache::new()),
        Arc::new(InMemoryMessageProducer::new()),
        Arc::new(InMemoryVectorStore::new()),
    ]
}
