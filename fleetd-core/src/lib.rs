pub mod capability;
pub mod config;
pub mod error;
pub mod platform;
pub mod state;
pub mod storage;
pub mod types;

pub use capability::{Capability, Compression, Tier};
pub use config::{AgentConfig, CampaignConfig, RetryConfig, ServerConfig};
pub use error::{ErrorContext, FleetError, FleetResult};
pub use platform::PlatformInfo;
pub use state::{AgentState, AgentStatus, StateManager};
pub use storage::{MetricStorage, StorageInfo, StoredMetric};
pub use types::*;
