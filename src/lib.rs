//! In-memory Amazon SQS and SNS.
//!
//! The [`Bus`] holds every queue, topic and subscription of one emulated
//! account. Queue and topic operations are methods on the bus taking the typed
//! requests from [`sqs::types`] and [`sns::types`]; the `server` modules of
//! each service translate the wire protocols onto them.

pub mod attribute;
pub mod bus;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod observer;
pub mod sns;
pub mod sqs;

pub use bus::{Bus, BusSnapshot, SweepReport};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Args, BusConfig};
pub use error::{BusError, BusResult, ErrorKind};
