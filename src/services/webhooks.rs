use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use sqlx::{PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::error::{map_db_error, AppError, AppResult};
use crate::schemas::{Backoff, RetryPolicy, UserContext, WebhookDef};
use crate::services::expression;

/// Delivery payload, identical for sync and async hooks. Retries of one
/// logical dispatch reuse the `idempotency_key` so receivers can dedupe.
pub fn build_payload(
    event: &str,
    entity: &str,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
    idempotency_key: Uuid,
) -> Value {
    json!({
        "event": event,
        "entity": entity,
        "action": action,
        "record": record,
        "old": old.cloned().unwrap_or(Value::Null),
        "changes": compute_changes(record, old),
        "user": {"id": user.id, "email": user.email, "roles": user.roles},
        "timestamp": Utc::now().to_rfc3339(),
        "idempotency_key": idempotency_key.to_string(),
    })
}

/// Fields whose values differ from the pre-image, with their new values.
fn compute_changes(record: &Value, old: Option<&Value>) -> Value {
    let Some(new_map) = record.as_object() else {
        return json!({});
    };
    let old_map = old.and_then(Value::as_object);
    let mut changes = Map::new();
    for (key, value) in new_map {
        let unchanged = old_map
            .and_then(|map| map.get(key))
            .is_some_and(|previous| previous == value);
        if !unchanged {
            changes.insert(key.clone(), value.clone());
        }
    }
    Value::Object(changes)
}

/// `{{env.VAR}}` placeholders in header values resolve from the process
/// environment at dispatch time; unset variables resolve to empty.
pub fn render_headers(headers: &Map<String, Value>) -> Vec<(String, String)> {
    let pattern = regex::Regex::new(r"\{\{env\.([A-Za-z0-9_]+)\}\}").expect("static pattern");
    headers
        .iter()
        .filter_map(|(name, value)| value.as_str().map(|text| (name.clone(), text.to_string())))
        .map(|(name, text)| {
            let rendered = pattern
                .replace_all(&text, |captures: &regex::Captures| {
                    std::env::var(&captures[1]).unwrap_or_default()
                })
                .to_string();
            (name, rendered)
        })
        .collect()
}

/// Condition gate over the write context; a missing condition always passes,
/// a broken one fails closed.
pub fn condition_allows(webhook: &WebhookDef, ctx: &Value) -> bool {
    let Some(condition) = &webhook.condition else {
        return true;
    };
    match expression::eval_bool(condition, ctx) {
        Ok(allowed) => allowed,
        Err(error) => {
            tracing::warn!(webhook_id = webhook.id, condition = %condition, error = %error, "Webhook condition failed; skipping dispatch");
            false
        }
    }
}

pub fn sign_body(secret: &str, body: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut encoded = String::with_capacity(digest.len() * 2);
    for byte in digest {
        encoded.push_str(&format!("{byte:02x}"));
    }
    format!("sha256={encoded}")
}

/// Retry delay in seconds for the attempt that just failed (0-based).
pub fn backoff_seconds(policy: &RetryPolicy, base_seconds: i64, attempt: i32) -> i64 {
    let attempt = attempt.max(0) as u32;
    match policy.backoff {
        Backoff::Exponential => base_seconds.saturating_mul(2_i64.saturating_pow(attempt)),
        Backoff::Linear => base_seconds.saturating_mul(attempt as i64 + 1),
    }
}

#[derive(Debug, Clone)]
pub struct DispatchResult {
    pub status: Option<u16>,
    pub body: String,
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        self.status.is_some_and(|status| (200..300).contains(&status))
    }

    pub fn response_json(&self) -> Value {
        match &self.error {
            Some(error) => json!({"error": error}),
            None => json!({"status": self.status, "body": self.body}),
        }
    }
}

/// One HTTP delivery. Transport errors come back as `error`, HTTP errors as
/// their status code; the caller decides what aborts.
pub async fn deliver(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    headers: &[(String, String)],
    body: &Value,
    signing_secret: Option<&str>,
    timeout: Duration,
) -> DispatchResult {
    let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
        .unwrap_or(reqwest::Method::POST);
    let body_text = body.to_string();

    let mut request = client
        .request(method, url)
        .timeout(timeout)
        .header("content-type", "application/json");
    for (name, value) in headers {
        request = request.header(name, value);
    }
    if let Some(secret) = signing_secret {
        request = request.header("x-fabrik-signature", sign_body(secret, &body_text));
    }

    match request.body(body_text).send().await {
        Ok(response) => {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            DispatchResult {
                status: Some(status),
                body: truncate(body, 4096),
                error: None,
            }
        }
        Err(error) => DispatchResult {
            status: None,
            body: String::new(),
            error: Some(error.to_string()),
        },
    }
}

fn truncate(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        text.truncate(limit);
    }
    text
}

// ---------------------------------------------------------------------------
// Sync path — inside the caller's transaction
// ---------------------------------------------------------------------------

/// Fire sync webhooks serially (callers pass them sorted by id). Any non-2xx
/// response or transport error aborts the surrounding transaction by
/// returning an error; the log row for each attempt rides in the same
/// transaction.
#[allow(clippy::too_many_arguments)]
pub async fn dispatch_sync(
    conn: &mut PgConnection,
    client: &reqwest::Client,
    webhooks: &[std::sync::Arc<WebhookDef>],
    ctx: &Value,
    event: &str,
    entity: &str,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
    timeout: Duration,
) -> AppResult<()> {
    for webhook in webhooks {
        if !condition_allows(webhook, ctx) {
            continue;
        }
        let idempotency_key = Uuid::new_v4();
        let payload = build_payload(event, entity, action, record, old, user, idempotency_key);
        let headers = render_headers(&webhook.headers);
        let result = deliver(
            client,
            &webhook.url,
            &webhook.method,
            &headers,
            &payload,
            webhook.signing_secret.as_deref(),
            timeout,
        )
        .await;

        let status = if result.is_success() { "success" } else { "failed" };
        insert_log(
            conn,
            webhook,
            entity,
            &payload,
            Some(result.response_json()),
            status,
            0,
            None,
            idempotency_key,
        )
        .await?;

        if !result.is_success() {
            tracing::warn!(
                webhook_id = webhook.id,
                url = %webhook.url,
                status = ?result.status,
                "Sync webhook failed; aborting write"
            );
            return Err(AppError::Dependency(format!(
                "Webhook '{}' rejected the write.",
                webhook.url
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Async path — pending log inside the transaction, delivery after commit
// ---------------------------------------------------------------------------

/// Queue an async webhook: the pending log rides in the write's transaction,
/// so a rollback enqueues nothing.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_async(
    conn: &mut PgConnection,
    webhook: &WebhookDef,
    ctx: &Value,
    event: &str,
    entity: &str,
    action: &str,
    record: &Value,
    old: Option<&Value>,
    user: &UserContext,
) -> AppResult<Option<Uuid>> {
    if !condition_allows(webhook, ctx) {
        return Ok(None);
    }
    let idempotency_key = Uuid::new_v4();
    let payload = build_payload(event, entity, action, record, old, user, idempotency_key);
    let log_id = insert_log(
        conn,
        webhook,
        entity,
        &payload,
        None,
        "pending",
        0,
        None,
        idempotency_key,
    )
    .await?;
    Ok(Some(log_id))
}

#[allow(clippy::too_many_arguments)]
async fn insert_log(
    conn: &mut PgConnection,
    webhook: &WebhookDef,
    entity: &str,
    payload: &Value,
    response: Option<Value>,
    status: &str,
    attempt: i32,
    next_retry_at: Option<chrono::DateTime<Utc>>,
    idempotency_key: Uuid,
) -> AppResult<Uuid> {
    let request = json!({
        "url": webhook.url,
        "method": webhook.method,
        "headers": webhook.headers,
        "signing_secret": webhook.signing_secret,
        "backoff": webhook.retry.backoff,
        "body": payload,
    });
    let row = sqlx::query(
        "INSERT INTO _webhook_logs
            (webhook_id, entity, request, response, status, attempt, max_attempts, next_retry_at, idempotency_key)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING id",
    )
    .bind(webhook.id)
    .bind(entity)
    .bind(&request)
    .bind(response)
    .bind(status)
    .bind(attempt)
    .bind(webhook.retry.max_attempts)
    .bind(next_retry_at)
    .bind(idempotency_key)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_db_error)?;
    row.try_get::<Uuid, _>("id").map_err(map_db_error)
}

/// Deliver one queued log row and record the outcome. Retries reuse the
/// row's original idempotency key (it is embedded in the stored request).
pub async fn attempt_delivery(
    pool: &PgPool,
    client: &reqwest::Client,
    log_id: Uuid,
    base_backoff_seconds: i64,
    timeout: Duration,
) {
    let row = match sqlx::query(
        "SELECT row_to_json(t) AS row FROM _webhook_logs t WHERE id = $1 LIMIT 1",
    )
    .bind(log_id)
    .fetch_optional(pool)
    .await
    {
        Ok(Some(row)) => row,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!(log_id = %log_id, error = %error, "Failed to load webhook log");
            return;
        }
    };
    let Some(log) = row.try_get::<Option<Value>, _>("row").ok().flatten() else {
        return;
    };

    let request = log.get("request").cloned().unwrap_or(json!({}));
    let url = request.get("url").and_then(Value::as_str).unwrap_or_default();
    let method = request.get("method").and_then(Value::as_str).unwrap_or("POST");
    let headers = request
        .get("headers")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let signing_secret = request
        .get("signing_secret")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);
    let body = request.get("body").cloned().unwrap_or(json!({}));
    let attempt = log.get("attempt").and_then(Value::as_i64).unwrap_or(0) as i32;
    let max_attempts = log.get("max_attempts").and_then(Value::as_i64).unwrap_or(3) as i32;
    let backoff: Backoff = log
        .get("request")
        .and_then(|r| r.get("backoff"))
        .and_then(|b| serde_json::from_value(b.clone()).ok())
        .unwrap_or_default();

    let rendered = render_headers(&headers);
    let result = deliver(
        client,
        url,
        method,
        &rendered,
        &body,
        signing_secret.as_deref(),
        timeout,
    )
    .await;

    let update = if result.is_success() {
        sqlx::query(
            "UPDATE _webhook_logs
             SET status = 'success', response = $2, updated_at = now(), next_retry_at = NULL
             WHERE id = $1",
        )
        .bind(log_id)
        .bind(result.response_json())
    } else {
        let next_attempt = attempt + 1;
        if next_attempt < max_attempts {
            let policy = RetryPolicy {
                max_attempts,
                backoff,
            };
            let delay = backoff_seconds(&policy, base_backoff_seconds, attempt);
            sqlx::query(
                "UPDATE _webhook_logs
                 SET status = 'retrying', attempt = $2, response = $3,
                     next_retry_at = now() + ($4 * interval '1 second'), updated_at = now()
                 WHERE id = $1",
            )
            .bind(log_id)
            .bind(next_attempt)
            .bind(result.response_json())
            .bind(delay as f64)
        } else {
            sqlx::query(
                "UPDATE _webhook_logs
                 SET status = 'failed', attempt = $2, response = $3,
                     next_retry_at = NULL, updated_at = now()
                 WHERE id = $1",
            )
            .bind(log_id)
            .bind(next_attempt)
            .bind(result.response_json())
        }
    };

    if let Err(error) = update.execute(pool).await {
        tracing::warn!(log_id = %log_id, error = %error, "Failed to record webhook outcome");
    }
}

/// Retry scheduler tick: claim due `retrying` rows one by one (compare-and-
/// swap back to `pending`) and re-deliver each.
pub async fn retry_due(
    pool: &PgPool,
    client: &reqwest::Client,
    base_backoff_seconds: i64,
    timeout: Duration,
    limit: i64,
) -> u32 {
    let due: Vec<Uuid> = match sqlx::query_scalar(
        "SELECT id FROM _webhook_logs
         WHERE status = 'retrying' AND next_retry_at <= now()
         ORDER BY next_retry_at
         LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    {
        Ok(ids) => ids,
        Err(error) => {
            tracing::warn!(error = %error, "Retry scan failed");
            return 0;
        }
    };

    let mut redispatched = 0;
    for log_id in due {
        let claimed = sqlx::query(
            "UPDATE _webhook_logs SET status = 'pending', updated_at = now()
             WHERE id = $1 AND status = 'retrying'",
        )
        .bind(log_id)
        .execute(pool)
        .await
        .map(|result| result.rows_affected() > 0)
        .unwrap_or(false);
        if !claimed {
            continue;
        }
        attempt_delivery(pool, client, log_id, base_backoff_seconds, timeout).await;
        redispatched += 1;
    }
    redispatched
}

/// Manual retry from the admin surface: make the row due immediately.
pub async fn manual_retry(pool: &PgPool, log_id: Uuid) -> AppResult<()> {
    let result = sqlx::query(
        "UPDATE _webhook_logs
         SET status = 'retrying', next_retry_at = now(), updated_at = now()
         WHERE id = $1 AND status IN ('failed', 'retrying')",
    )
    .bind(log_id)
    .execute(pool)
    .await
    .map_err(map_db_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(
            "Webhook log not found or not retryable.".to_string(),
        ));
    }
    Ok(())
}

/// Fire-and-forget delivery for state-machine and workflow webhook actions.
pub fn fire_and_forget(client: reqwest::Client, url: String, method: String, payload: Value) {
    tokio::spawn(async move {
        let result = deliver(
            &client,
            &url,
            &method,
            &[],
            &payload,
            None,
            Duration::from_secs(10),
        )
        .await;
        if !result.is_success() {
            tracing::warn!(url = %url, status = ?result.status, "Fire-and-forget webhook failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserContext {
        UserContext {
            id: "u1".into(),
            email: "ada@example.test".into(),
            roles: vec!["editor".into()],
        }
    }

    #[test]
    fn payload_carries_changes_and_key() {
        let old = json!({"status": "draft", "total": 10});
        let record = json!({"status": "sent", "total": 10});
        let key = Uuid::new_v4();
        let payload = build_payload(
            "after_write",
            "invoice",
            "update",
            &record,
            Some(&old),
            &user(),
            key,
        );
        assert_eq!(payload["changes"], json!({"status": "sent"}));
        assert_eq!(payload["idempotency_key"], json!(key.to_string()));
        assert_eq!(payload["entity"], json!("invoice"));
        assert_eq!(payload["old"]["status"], json!("draft"));
    }

    #[test]
    fn create_payload_changes_are_full_record() {
        let record = json!({"a": 1, "b": 2});
        let payload = build_payload(
            "after_write",
            "order",
            "create",
            &record,
            None,
            &user(),
            Uuid::new_v4(),
        );
        assert_eq!(payload["changes"], record);
        assert_eq!(payload["old"], Value::Null);
    }

    #[test]
    fn backoff_doubles_or_grows_linearly_from_base() {
        let exponential = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
        };
        assert_eq!(backoff_seconds(&exponential, 30, 0), 30);
        assert_eq!(backoff_seconds(&exponential, 30, 1), 60);
        assert_eq!(backoff_seconds(&exponential, 30, 2), 120);

        let linear = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Linear,
        };
        assert_eq!(backoff_seconds(&linear, 30, 0), 30);
        assert_eq!(backoff_seconds(&linear, 30, 1), 60);
        assert_eq!(backoff_seconds(&linear, 30, 2), 90);
    }

    #[test]
    fn header_templating_reads_env() {
        std::env::set_var("FABRIK_TEST_TOKEN", "sekrit");
        let mut headers = Map::new();
        headers.insert(
            "authorization".to_string(),
            json!("Bearer {{env.FABRIK_TEST_TOKEN}}"),
        );
        headers.insert("x-static".to_string(), json!("plain"));
        headers.insert(
            "x-missing".to_string(),
            json!("{{env.FABRIK_TEST_UNSET_VAR}}"),
        );
        let rendered = render_headers(&headers);
        let get = |name: &str| {
            rendered
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
                .unwrap()
        };
        assert_eq!(get("authorization"), "Bearer sekrit");
        assert_eq!(get("x-static"), "plain");
        assert_eq!(get("x-missing"), "");
    }

    #[test]
    fn condition_gates_dispatch() {
        let webhook: WebhookDef = serde_json::from_value(json!({
            "id": 1, "entity": "order", "hook": "after_write",
            "url": "https://example.test/hook",
            "condition": "record.total > 100"
        }))
        .unwrap();
        assert!(condition_allows(&webhook, &json!({"record": {"total": 200}})));
        assert!(!condition_allows(&webhook, &json!({"record": {"total": 5}})));

        let broken: WebhookDef = serde_json::from_value(json!({
            "id": 2, "entity": "order", "hook": "after_write",
            "url": "https://example.test/hook",
            "condition": "record.total >"
        }))
        .unwrap();
        assert!(!condition_allows(&broken, &json!({"record": {}})));
    }

    #[test]
    fn signature_is_stable_hex() {
        let first = sign_body("secret", "{\"a\":1}");
        let second = sign_body("secret", "{\"a\":1}");
        assert_eq!(first, second);
        assert!(first.starts_with("sha256="));
        assert_eq!(first.len(), "sha256=".len() + 64);
        assert_ne!(first, sign_body("other", "{\"a\":1}"));
    }

    #[test]
    fn dispatch_result_success_window() {
        let ok = DispatchResult {
            status: Some(204),
            body: String::new(),
            error: None,
        };
        assert!(ok.is_success());
        let server_error = DispatchResult {
            status: Some(500),
            body: "boom".into(),
            error: None,
        };
        assert!(!server_error.is_success());
        let transport = DispatchResult {
            status: None,
            body: String::new(),
            error: Some("timeout".into()),
        };
        assert!(!transport.is_success());
        assert_eq!(transport.response_json(), json!({"error": "timeout"}));
    }
}
