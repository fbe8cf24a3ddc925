use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::tenancy::AppManager;

#[derive(Clone)]
pub struct PlatformState {
    pub config: AppConfig,
    pub platform_pool: PgPool,
    pub apps: Arc<AppManager>,
    pub http: reqwest::Client,
}

impl PlatformState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let platform_pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_seconds))
            .connect_lazy(&config.database_url)?;

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        let apps = Arc::new(AppManager::new(
            config.clone(),
            platform_pool.clone(),
            http.clone(),
        ));

        Ok(Self {
            config,
            platform_pool,
            apps,
            http,
        })
    }
}
