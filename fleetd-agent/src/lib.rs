pub mod agent;
pub mod client;
pub mod rpc;
pub mod service;
pub mod supervisor;
pub mod telemetry;
pub mod updater;

pub use agent::{Agent, AgentHandle, run_forever};
pub use client::ControlPlaneClient;
pub use service::ServiceManager;
pub use supervisor::{ProcessSpec, Supervisor};
pub use updater::{UpdatePhase, Updater};
