mod broker;
mod config;
mod directory;
mod punch;
mod registrator;
mod request;

pub use broker::{DEFAULT_POPULATE_COUNT, MasterServer, ServerEntry};
pub use config::{BrokerSettings, ConfigError, DEFAULT_MASTER_PORT, DEFAULT_TICK_RATE, MasterConfig};
pub use directory::{Listing, ServerKey};
pub use punch::{PunchRequest, PunchStage};
pub use registrator::Registrator;
pub use request::{MAX_SENDS, MasterRequest, RETRY_DELAY, RequestOutcome};
