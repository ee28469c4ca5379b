pub mod commands;
pub mod db;
pub mod error;
pub mod feed;
pub mod state;
