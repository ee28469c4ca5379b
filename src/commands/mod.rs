pub mod feed_sync;
pub mod health;
