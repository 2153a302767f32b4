pub mod error;
pub mod fanout;
pub mod filter;
pub mod server;
pub mod state;
pub mod topic;
pub mod types;
