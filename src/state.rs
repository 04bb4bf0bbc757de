use std::sync::Arc;

use crate::config::AppConfig;
use crate::store::{self, AccountStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn AccountStore>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);
        let store = store::connect(&config.database_url).await?;
        Ok(Self { store, config })
    }
}
