mod auth;
mod client;
mod command;
mod config;
mod cooldown;
mod coordinator;
pub mod discovery;
mod error;
mod integration;
mod logger;
pub mod protocol;
mod registry;
mod state;
pub mod subscription;
mod types;
mod webhook;

pub use auth::{Credential, TokenEndpoint, TokenStore};
pub use client::{http_client, ApiClient, ApiClientBuilder, ApiResponse, CallStats, Classification, RetryPolicy};
pub use command::CommandDispatcher;
pub use config::{
    ConfigHandle, ConfigStore, JsonFileConfigStore, MemoryConfigStore, Options, SelectedThermostat, StoredConfig,
};
pub use cooldown::CooldownState;
pub use coordinator::{CoordinatorEvent, PollCoordinator, PollCoordinatorBuilder, PollOutcome, PollReport};
pub use error::{Error, Result};
pub use integration::{Integration, IntegrationBuilder};
pub use logger::MessageLogMode;
pub use registry::DeviceRegistry;
pub use state::{DeviceStateTable, Source, StateEntry};
pub use types::*;
pub use webhook::{extract_status_objects, WebhookMerger, WebhookReply};
