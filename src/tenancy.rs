use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::RngCore;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::{watch, Mutex};

use crate::config::AppConfig;
use crate::error::{map_db_error, AppError, AppResult};
use crate::registry::Registry;
use crate::repository::bootstrap;
use crate::repository::table_service::validate_identifier;
use crate::schemas::{AppRecord, DbDriver};
use crate::services::instrumentation::{spawn_event_buffer, Instrumentation};

/// Everything one tenant owns: its pool, registry snapshot, instrumentation
/// pipeline and scheduler lifecycle. Dropping the last Arc after `delete`
/// releases the pool.
pub struct AppContext {
    pub name: String,
    pub display_name: String,
    pub pool: PgPool,
    pub registry: Registry,
    pub jwt_secret: String,
    pub instrumentation: Instrumentation,
    pub http: reqwest::Client,
    pub webhook_timeout: Duration,
    pub backoff_base_seconds: i64,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn stop_schedulers(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("name", &self.name)
            .finish()
    }
}

/// Directory of live tenants. Lookup is read-mostly; creation of one app is
/// serialized by a sentinel so two concurrent creates of the same name
/// cannot double-provision.
pub struct AppManager {
    config: AppConfig,
    platform_pool: PgPool,
    http: reqwest::Client,
    apps: RwLock<HashMap<String, Arc<AppContext>>>,
    creating: Mutex<HashSet<String>>,
}

impl AppManager {
    pub fn new(config: AppConfig, platform_pool: PgPool, http: reqwest::Client) -> Self {
        Self {
            config,
            platform_pool,
            http,
            apps: RwLock::new(HashMap::new()),
            creating: Mutex::new(HashSet::new()),
        }
    }

    pub fn platform_pool(&self) -> &PgPool {
        &self.platform_pool
    }

    /// Materialize every active app at startup.
    pub async fn load_all(self: &Arc<Self>) -> AppResult<usize> {
        let rows = sqlx::query(
            "SELECT name, display_name, db_name, db_driver, jwt_secret, status
             FROM apps WHERE status = 'active' ORDER BY name",
        )
        .fetch_all(&self.platform_pool)
        .await
        .map_err(map_db_error)?;

        let mut loaded = 0usize;
        for row in rows {
            let record = AppRecord {
                name: row.try_get("name").map_err(map_db_error)?,
                display_name: row.try_get("display_name").map_err(map_db_error)?,
                db_name: row.try_get("db_name").map_err(map_db_error)?,
                db_driver: parse_driver(row.try_get::<String, _>("db_driver").map_err(map_db_error)?.as_str()),
                jwt_secret: row.try_get("jwt_secret").map_err(map_db_error)?,
                status: row.try_get("status").map_err(map_db_error)?,
            };
            match self.build_context(&record).await {
                Ok(ctx) => {
                    self.insert(ctx);
                    loaded += 1;
                }
                Err(error) => {
                    tracing::error!(app = %record.name, error = %error, "Failed to load app context");
                }
            }
        }
        Ok(loaded)
    }

    pub fn get(&self, name: &str) -> AppResult<Arc<AppContext>> {
        self.apps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::AppNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let mut apps: Vec<(String, String)> = self
            .apps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|ctx| (ctx.name.clone(), ctx.display_name.clone()))
            .collect();
        apps.sort();
        apps
    }

    /// Provision a new app: physical database, system tables, seeded admin,
    /// generated JWT secret, registered context. Returns the one-time admin
    /// password alongside the context.
    pub async fn create(
        self: &Arc<Self>,
        name: &str,
        display_name: &str,
        driver: DbDriver,
    ) -> AppResult<(Arc<AppContext>, String)> {
        let name = validate_identifier(name)?.to_string();
        if driver == DbDriver::Sqlite {
            return Err(AppError::validation(
                "db_driver",
                "driver",
                "The sqlite driver is not supported by this deployment.",
            ));
        }

        // Sentinel: one in-flight provisioning per app name.
        {
            let mut creating = self.creating.lock().await;
            if !creating.insert(name.clone()) {
                return Err(AppError::Conflict(format!(
                    "App '{name}' is already being created."
                )));
            }
        }
        let result = self.provision(&name, display_name).await;
        self.creating.lock().await.remove(&name);
        result
    }

    async fn provision(
        self: &Arc<Self>,
        name: &str,
        display_name: &str,
    ) -> AppResult<(Arc<AppContext>, String)> {
        if self.get(name).is_ok() {
            return Err(AppError::Conflict(format!("App '{name}' already exists.")));
        }
        let existing = sqlx::query("SELECT 1 FROM apps WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.platform_pool)
            .await
            .map_err(map_db_error)?;
        if existing.is_some() {
            return Err(AppError::Conflict(format!("App '{name}' already exists.")));
        }

        let db_name = format!("fabrik_app_{name}");
        sqlx::query(&format!("CREATE DATABASE \"{db_name}\""))
            .execute(&self.platform_pool)
            .await
            .map_err(|error| {
                tracing::error!(app = name, error = %error, "CREATE DATABASE failed");
                map_db_error(error)
            })?;

        let record = AppRecord {
            name: name.to_string(),
            display_name: display_name.trim().to_string(),
            db_name: db_name.clone(),
            db_driver: DbDriver::Postgres,
            jwt_secret: random_hex(48),
            status: "active".to_string(),
        };

        // System tables and the seeded admin land before the context exists,
        // so its registry load and schedulers see a complete database.
        let url = self
            .config
            .app_database_url(&db_name)
            .map_err(|error| AppError::Internal(format!("Bad database URL: {error}")))?;
        let bootstrap_pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(self.config.db_acquire_timeout_seconds))
            .connect(&url)
            .await
            .map_err(|error| {
                AppError::Dependency(format!("Cannot connect to new app database: {error}"))
            })?;
        bootstrap::apply_app_system_ddl(&bootstrap_pool).await?;

        let admin_password = random_hex(12);
        let password_hash = bcrypt::hash(&admin_password, bcrypt::DEFAULT_COST)
            .map_err(|error| AppError::Internal(format!("Password hashing failed: {error}")))?;
        sqlx::query(
            "INSERT INTO _users (email, password_hash, roles)
             VALUES ($1, $2, $3)
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(format!("admin@{name}.local"))
        .bind(&password_hash)
        .bind(json!(["admin"]))
        .execute(&bootstrap_pool)
        .await
        .map_err(map_db_error)?;
        bootstrap_pool.close().await;

        let ctx = self.build_context(&record).await?;

        sqlx::query(
            "INSERT INTO apps (name, display_name, db_name, db_driver, jwt_secret, status)
             VALUES ($1, $2, $3, 'postgres', $4, 'active')",
        )
        .bind(&record.name)
        .bind(&record.display_name)
        .bind(&record.db_name)
        .bind(&record.jwt_secret)
        .execute(&self.platform_pool)
        .await
        .map_err(map_db_error)?;

        self.insert(ctx.clone());
        tracing::info!(app = name, db = %db_name, "App provisioned");
        Ok((ctx, admin_password))
    }

    /// Tear the app down: stop schedulers (flushing the event buffer), close
    /// the pool, drop the database, forget the directory row.
    pub async fn delete(&self, name: &str) -> AppResult<()> {
        let ctx = {
            let mut apps = self
                .apps
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            apps.remove(name)
        }
        .ok_or_else(|| AppError::AppNotFound(name.to_string()))?;

        ctx.stop_schedulers();
        ctx.pool.close().await;

        let row = sqlx::query("SELECT db_name FROM apps WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.platform_pool)
            .await
            .map_err(map_db_error)?;
        if let Some(row) = row {
            let db_name: String = row.try_get("db_name").map_err(map_db_error)?;
            if validate_identifier(&db_name).is_ok() {
                if let Err(error) = sqlx::query(&format!(
                    "DROP DATABASE IF EXISTS \"{db_name}\" WITH (FORCE)"
                ))
                .execute(&self.platform_pool)
                .await
                {
                    tracing::error!(app = name, error = %error, "DROP DATABASE failed");
                }
            }
        }

        sqlx::query("DELETE FROM apps WHERE name = $1")
            .bind(name)
            .execute(&self.platform_pool)
            .await
            .map_err(map_db_error)?;
        tracing::info!(app = name, "App deleted");
        Ok(())
    }

    async fn build_context(self: &Arc<Self>, record: &AppRecord) -> AppResult<Arc<AppContext>> {
        let url = self
            .config
            .app_database_url(&record.db_name)
            .map_err(|error| AppError::Internal(format!("Bad database URL: {error}")))?;
        let pool = PgPoolOptions::new()
            .max_connections(self.config.db_max_connections)
            .acquire_timeout(Duration::from_secs(self.config.db_acquire_timeout_seconds))
            .connect(&url)
            .await
            .map_err(|error| {
                AppError::Dependency(format!(
                    "Cannot connect to database for app '{}': {error}",
                    record.name
                ))
            })?;

        let sample_rate = self.config.effective_sample_rate();
        let instrumentation = if sample_rate > 0.0 {
            let sender = spawn_event_buffer(
                pool.clone(),
                self.config.event_buffer_capacity,
                self.config.event_flush_batch_size,
                Duration::from_millis(self.config.event_flush_interval_ms),
            );
            Instrumentation::new(sender, sample_rate)
        } else {
            Instrumentation::disabled()
        };

        let (shutdown, _) = watch::channel(false);
        let ctx = Arc::new(AppContext {
            name: record.name.clone(),
            display_name: record.display_name.clone(),
            pool,
            registry: Registry::empty(),
            jwt_secret: record.jwt_secret.clone(),
            instrumentation,
            http: self.http.clone(),
            webhook_timeout: Duration::from_secs(self.config.webhook_timeout_seconds),
            backoff_base_seconds: self.config.webhook_backoff_base_seconds,
            shutdown,
        });

        if let Err(error) = ctx.registry.reload(&ctx.pool).await {
            tracing::warn!(app = %record.name, error = %error, "Initial registry load failed");
        }

        if self.config.scheduler_enabled {
            let scheduler_ctx = ctx.clone();
            let intervals = crate::services::scheduler::Intervals {
                workflow_timeout_poll: Duration::from_secs(
                    self.config.workflow_timeout_poll_seconds.max(1),
                ),
                webhook_retry_poll: Duration::from_secs(
                    self.config.webhook_retry_poll_seconds.max(1),
                ),
                event_retention_days: self.config.event_retention_days,
            };
            tokio::spawn(async move {
                crate::services::scheduler::run_app_scheduler(scheduler_ctx, intervals).await;
            });
        }

        Ok(ctx)
    }

    fn insert(&self, ctx: Arc<AppContext>) {
        self.apps
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(ctx.name.clone(), ctx);
    }

    /// Stop every app's schedulers and flush buffers; used on shutdown.
    pub async fn shutdown_all(&self) {
        let contexts: Vec<Arc<AppContext>> = self
            .apps
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect();
        for ctx in contexts {
            ctx.stop_schedulers();
        }
    }
}

fn parse_driver(raw: &str) -> DbDriver {
    match raw {
        "sqlite" => DbDriver::Sqlite,
        _ => DbDriver::Postgres,
    }
}

fn random_hex(bytes: usize) -> String {
    let mut buffer = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buffer);
    let mut encoded = String::with_capacity(bytes * 2);
    for byte in buffer {
        encoded.push_str(&format!("{byte:02x}"));
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_length_and_variation() {
        let first = random_hex(48);
        let second = random_hex(48);
        assert_eq!(first.len(), 96);
        assert_ne!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn driver_parse_defaults_to_postgres() {
        assert_eq!(parse_driver("postgres"), DbDriver::Postgres);
        assert_eq!(parse_driver("sqlite"), DbDriver::Sqlite);
        assert_eq!(parse_driver("unknown"), DbDriver::Postgres);
    }
}
