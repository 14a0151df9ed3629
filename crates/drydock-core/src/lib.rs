//! Drydock Core Library
//!
//! Provides the deployment orchestration logic: artifact version
//! resolution, checksummed downloads, container lifecycle, marker-file
//! polling and single-flight run scheduling.

pub mod admin;
pub mod config;
pub mod container;
pub mod download;
pub mod error;
pub mod events;
pub mod fetch;
pub mod model;
pub mod notify;
pub mod poller;
pub mod registry;
pub mod resolver;
pub mod scheduler;
pub mod store;

/// Re-exports of commonly used types
pub mod prelude {
    // Configuration
    pub use crate::config::{AppConfig, ProxyEndpoint};

    // Domain model
    pub use crate::model::{
        ArtifactRecord, LogLevel, LogLine, NotifyMode, NotifySettings, Run, RunStatus,
        ServerRecord, ServerSpec, StepStatus, TargetConfig,
    };

    // Errors
    pub use crate::error::{DeployError, Result};

    // Stores and events
    pub use crate::events::{BroadcastSink, EventSink, NullSink, RunEvent};
    pub use crate::store::{ConfigStore, MemoryStore, RunStore};

    // Orchestration
    pub use crate::admin::AdminService;
    pub use crate::container::{ContainerRuntime, DockerRuntime};
    pub use crate::fetch::{HttpFetch, ProxyPool};
    pub use crate::notify::{LogNotifier, Notifier};
    pub use crate::scheduler::{CancelOutcome, RunRequest, Scheduler};
}
