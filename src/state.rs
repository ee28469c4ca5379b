use crate::feed::pipeline::FeedSync;
use crate::feed::types::FeedStatusSnapshot;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: Option<SqlitePool>,
    pub feed: Mutex<Option<Arc<FeedSync>>>,
    pub feed_status: Arc<RwLock<FeedStatusSnapshot>>,
}

impl AppState {
    /// `db_pool = None` runs without the local cache mirror.
    pub fn new(db_pool: Option<SqlitePool>) -> Self {
        let feed_status = FeedStatusSnapshot::stopped(Some("feed idle".to_string()));

        Self {
            started_at: Instant::now(),
            db_pool,
            feed: Mutex::new(None),
            feed_status: Arc::new(RwLock::new(feed_status)),
        }
    }
}
