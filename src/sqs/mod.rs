pub mod attributes;
pub mod error;
pub mod expiry;
pub mod message;
pub mod move_task;
pub mod queue;
pub mod server;
pub mod state;
pub mod types;
