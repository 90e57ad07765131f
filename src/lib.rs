//! Classline Realtime Client Library
//!
//! Realtime delivery core for the Classline web client: a websocket
//! pub/sub session with automatic reconnection, topic subscriptions,
//! server-event classification, reducible in-memory state, and a
//! paginated chat history loader.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod history;
pub mod models;
pub mod protocol;
pub mod session;
pub mod state;
pub mod subscriptions;

pub use client::LiveSession;
pub use config::RealtimeConfig;
pub use error::RealtimeError;
pub use history::HistoryLoader;
pub use protocol::Topic;
pub use session::LinkState;
