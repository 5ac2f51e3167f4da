use crate::queue::audit::AuditSink;
use crate::shared::config::AppConfig;
use crate::shared::utils::DbPool;
use std::sync::Arc;

pub struct AppState {
    pub config: Option<AppConfig>,
    pub conn: DbPool,
    pub audit: Arc<dyn AuditSink>,
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            conn: self.conn.clone(),
            audit: Arc::clone(&self.audit),
        }
    }
}
