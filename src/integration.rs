use std::sync::Arc;

use tracing::{info, warn};

use crate::auth::TokenStore;
use crate::client::{http_client, ApiClient, RetryPolicy};
use crate::command::CommandDispatcher;
use crate::config::{ConfigHandle, StoredConfig};
use crate::coordinator::{CoordinatorEvent, PollCoordinator};
use crate::logger::MessageLogMode;
use crate::registry::DeviceRegistry;
use crate::state::DeviceStateTable;
use crate::subscription::{self, webhook_endpoint};
use crate::webhook::{WebhookMerger, WebhookReply};
use crate::{Error, Result};

type EventCallback = Box<dyn Fn(&CoordinatorEvent) + Send + Sync>;

pub struct IntegrationBuilder {
    config: ConfigHandle,
    policy: RetryPolicy,
    message_log: Option<(MessageLogMode, String)>,
    callbacks: Vec<EventCallback>,
}

impl IntegrationBuilder {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            config,
            policy: RetryPolicy::default(),
            message_log: None,
            callbacks: Vec::new(),
        }
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<String>) -> Self {
        self.message_log = Some((mode, path.into()));
        self
    }

    pub fn on_event(mut self, f: impl Fn(&CoordinatorEvent) + Send + Sync + 'static) -> Self {
        self.callbacks.push(Box::new(f));
        self
    }

    pub fn build(self) -> Result<Integration> {
        let stored = self.config.load()?;
        stored.options.validate()?;

        let http = http_client(&self.policy)?;
        let tokens = Arc::new(
            TokenStore::new(http.clone(), stored.token_endpoint(), stored.credential()?)
                .with_persistence(self.config.clone()),
        );

        let mut client = ApiClient::builder(tokens, stored.subscription_key.clone())
            .base_url(stored.api_base_url.clone())
            .retry_policy(self.policy)
            .http_client(http);
        if let Some((mode, path)) = self.message_log {
            client = client.message_log(mode, path);
        }
        let client = Arc::new(client.build()?);

        let registry = Arc::new(DeviceRegistry::from_selection(&stored.selected_thermostats));
        let state = Arc::new(DeviceStateTable::new());

        let mut coordinator = PollCoordinator::builder(client.clone(), registry.clone(), state.clone())
            .options(stored.options.clone())
            .config(self.config.clone());
        for cb in self.callbacks {
            coordinator = coordinator.on_event(cb);
        }

        let webhooks = WebhookMerger::new(registry.clone(), state.clone(), stored.options.debounce_window())
            .with_persistence(self.config.clone());
        let commands = CommandDispatcher::new(client.clone(), registry.clone(), state.clone());

        info!(devices = registry.len(), "integration loaded");
        Ok(Integration {
            config: self.config,
            client,
            registry,
            state,
            coordinator: Arc::new(coordinator.build()),
            webhooks: Arc::new(webhooks),
            commands,
        })
    }
}

/// Everything one configured account needs, wired from host storage.
pub struct Integration {
    config: ConfigHandle,
    client: Arc<ApiClient>,
    registry: Arc<DeviceRegistry>,
    state: Arc<DeviceStateTable>,
    coordinator: Arc<PollCoordinator>,
    webhooks: Arc<WebhookMerger>,
    commands: CommandDispatcher,
}

impl Integration {
    pub fn builder(config: ConfigHandle) -> IntegrationBuilder {
        IntegrationBuilder::new(config)
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn state(&self) -> &Arc<DeviceStateTable> {
        &self.state
    }

    pub fn coordinator(&self) -> &Arc<PollCoordinator> {
        &self.coordinator
    }

    pub fn webhooks(&self) -> &Arc<WebhookMerger> {
        &self.webhooks
    }

    pub fn commands(&self) -> &CommandDispatcher {
        &self.commands
    }

    /// Raw webhook body from the host transport.
    pub fn handle_webhook(&self, body: &[u8]) -> WebhookReply {
        self.webhooks.handle_body(body)
    }

    /// Make sure every selected thermostat has a push subscription pointing at
    /// its webhook endpoint, and store the subscription ids. Returns how many
    /// subscriptions are in place.
    pub async fn subscribe_webhooks(&self) -> Result<usize> {
        let stored = self.config.load()?;
        let external_url = stored
            .external_url
            .clone()
            .ok_or_else(|| Error::Config("external_url is required for webhook subscriptions".to_string()))?;

        let mut obtained: Vec<(String, String)> = Vec::new();
        for thermostat in &stored.selected_thermostats {
            let endpoint = webhook_endpoint(&external_url, &thermostat.webhook_id);
            match subscription::ensure_subscription(&self.client, &thermostat.plant_id, &endpoint).await {
                Ok(id) => obtained.push((thermostat.id.clone(), id)),
                Err(e) if e.is_account_wide() => return Err(e),
                Err(e) => warn!(device = %thermostat.id, error = %e, "webhook subscription failed"),
            }
        }

        let count = obtained.len();
        self.config.update(|stored| set_subscription_ids(stored, &obtained))?;
        Ok(count)
    }

    /// Remove the push subscriptions created by [`Integration::subscribe_webhooks`].
    pub async fn unload(&self) -> Result<()> {
        let stored = self.config.load()?;
        let mut removed: Vec<String> = Vec::new();
        for thermostat in &stored.selected_thermostats {
            let Some(ref subscription_id) = thermostat.subscription_id else {
                continue;
            };
            match subscription::delete(&self.client, &thermostat.plant_id, subscription_id).await {
                Ok(()) => removed.push(thermostat.id.clone()),
                Err(e) => warn!(device = %thermostat.id, error = %e, "could not remove webhook subscription"),
            }
        }

        self.config.update(|stored| {
            for thermostat in &mut stored.selected_thermostats {
                if removed.contains(&thermostat.id) {
                    thermostat.subscription_id = None;
                }
            }
        })?;
        info!(removed = removed.len(), "integration unloaded");
        Ok(())
    }
}

fn set_subscription_ids(stored: &mut StoredConfig, obtained: &[(String, String)]) {
    for thermostat in &mut stored.selected_thermostats {
        if let Some((_, id)) = obtained.iter().find(|(device, _)| *device == thermostat.id) {
            thermostat.subscription_id = Some(id.clone());
        }
    }
}
