pub mod config;
pub mod types;
pub mod error;
pub mod protocol;
pub mod blockchain;
pub mod external;
pub mod worker;
pub mod fleet;

pub use config::Config;
pub use error::{ErrorTier, WorkerError};
pub use types::*;
