//! Line-oriented chat relay: length-prefixed frames in, room-scoped
//! broadcasts out, SQLite behind a paging cache.

pub mod cache;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod models;
pub mod notify;
pub mod observer;
pub mod registry;
pub mod repository;
pub mod server;
