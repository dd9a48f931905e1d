use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use uuid::Uuid;

pub mod loggable;
pub use loggable::{Loggable, Severity};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent<T> {
    pub id: Uuid,
    pub name: String,
    pub occurred_at: DateTime<Utc>,
    pub actor_role_id: Option<i64>,
    pub subject_id: Option<i64>,
    pub payload: T,
}

impl<T> DomainEvent<T> {
    pub fn new(name: String, actor_role_id: Option<i64>, subject_id: Option<i64>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            occurred_at: Utc::now(),
            actor_role_id,
            subject_id,
            payload,
        }
    }
}

pub type EventBus = broadcast::Sender<Value>;

pub fn init_event_bus() -> (EventBus, broadcast::Receiver<Value>) {
    broadcast::channel(1024)
}

/// Request context for audit entries (IP, User-Agent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &axum::http::HeaderMap) -> Self {
        let ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
            .or_else(|| {
                headers
                    .get("x-real-ip")
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            });

        let user_agent = headers
            .get(axum::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Self { ip, user_agent }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditPayload {
    pub entity: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<RequestContext>,
    pub severity: Severity,
}

/// Publish an audit event for `entity`. The event name is `<entity_type>.<action>`,
/// e.g. `grant.added`.
///
/// Publishing never fails the caller: with no listener attached the event is dropped.
pub fn log_activity<T: Loggable>(
    event_bus: &EventBus,
    action: &str,
    actor_role_id: Option<i64>,
    entity: &T,
    context: Option<RequestContext>,
) {
    let payload = AuditPayload {
        entity: serde_json::to_value(entity).unwrap_or_default(),
        context,
        severity: entity.severity_for_action(action),
    };

    let event = DomainEvent::new(
        format!("{}.{}", T::entity_type(), action),
        actor_role_id,
        Some(entity.subject_id()),
        payload,
    );

    let _ = event_bus.send(serde_json::to_value(event).unwrap_or_default());
}

/// SHA256(prev_hash || payload), hex encoded.
pub fn chain_hash(prev_hash: Option<&str>, payload: &str) -> String {
    let mut hasher = Sha256::new();
    if let Some(prev) = prev_hash {
        hasher.update(prev.as_bytes());
    }
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persist one bus event into the hash-chained `audit_log`.
pub async fn record_event(pool: &SqlitePool, event: &Value) -> Result<(), sqlx::Error> {
    let name = event.get("name").and_then(|v| v.as_str()).unwrap_or("unknown");
    let actor_role_id = event.get("actor_role_id").and_then(|v| v.as_i64());
    let subject_id = event.get("subject_id").and_then(|v| v.as_i64());
    let occurred_at = event
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let severity = event
        .get("payload")
        .and_then(|p| p.get("severity"))
        .and_then(|s| s.as_str())
        .unwrap_or(Severity::Important.as_str());
    let id = event
        .get("id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let payload = serde_json::to_string(event).unwrap_or_default();

    let mut tx = pool.begin().await?;

    let prev_hash: Option<String> = sqlx::query_scalar("SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1")
        .fetch_optional(&mut *tx)
        .await?;
    let hash = chain_hash(prev_hash.as_deref(), &payload);

    sqlx::query(
        r#"
        INSERT INTO audit_log (id, event_name, actor_role_id, subject_id, occurred_at, payload, severity, prev_hash, hash)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(name)
    .bind(actor_role_id)
    .bind(subject_id)
    .bind(occurred_at.to_rfc3339())
    .bind(&payload)
    .bind(severity)
    .bind(&prev_hash)
    .bind(&hash)
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}

pub async fn start_audit_listener(mut rx: broadcast::Receiver<Value>, pool: SqlitePool) {
    tracing::info!("audit listener started");
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Err(e) = record_event(&pool, &event).await {
                    tracing::error!(error = %e, "failed to save audit entry");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "audit listener lagged; events dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
