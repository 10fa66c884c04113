//! `cadence-core` — primitives shared by every cadence crate.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CadenceConfig;
pub use error::{CoreError, Result};
pub use types::EntityId;
