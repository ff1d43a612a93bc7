//! Push-notification (C2C) subscription maintenance.
//!
//! A subscription registers one of the host's webhook endpoints for status
//! pushes of one plant. Creating one that already exists answers 409; that is
//! a success for the request layer, and only [`ensure_subscription`] reacts
//! to it by clearing out our stale registrations and trying again.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::protocol::{plant_subscription_path, subscription_path, subscriptions_path, WEBHOOK_PATH};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub plant_id: Option<String>,
    pub endpoint_url: String,
}

impl Subscription {
    /// Registered by this integration (any instance of it) rather than by
    /// another client of the account.
    pub fn is_ours(&self) -> bool {
        self.endpoint_url.contains(WEBHOOK_PATH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created(String),
    /// The upstream already has a subscription for this plant and endpoint.
    Conflict,
}

pub fn webhook_endpoint(external_url: &str, webhook_id: &str) -> String {
    format!("{}{}{}", external_url.trim_end_matches('/'), WEBHOOK_PATH, webhook_id)
}

pub async fn list(client: &ApiClient) -> Result<Vec<Subscription>> {
    let resp = client.get(&subscriptions_path()).await?;
    Ok(parse_subscriptions(&resp.data))
}

pub async fn subscribe(client: &ApiClient, plant_id: &str, endpoint_url: &str) -> Result<SubscribeOutcome> {
    let body = json!({ "EndPointUrl": endpoint_url });
    let resp = client.post(&plant_subscription_path(plant_id), &body).await?;
    if resp.status == 409 {
        warn!(plant = %plant_id, "subscription already exists");
        return Ok(SubscribeOutcome::Conflict);
    }
    let id = resp
        .data
        .get("subscriptionId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Decode("subscription response without subscriptionId".to_string()))?;
    info!(plant = %plant_id, subscription = %id, "webhook subscription created");
    Ok(SubscribeOutcome::Created(id.to_string()))
}

pub async fn delete(client: &ApiClient, plant_id: &str, subscription_id: &str) -> Result<()> {
    client.delete(&subscription_path(plant_id, subscription_id)).await?;
    info!(plant = %plant_id, subscription = %subscription_id, "webhook subscription deleted");
    Ok(())
}

/// Delete every subscription of `plant_id` that points at one of our webhook
/// endpoints. Returns how many were removed; individual delete failures are
/// logged and skipped.
pub async fn cleanup_orphans(client: &ApiClient, plant_id: &str) -> Result<usize> {
    let ours: Vec<Subscription> = list(client)
        .await?
        .into_iter()
        .filter(|s| s.is_ours() && s.plant_id.as_deref() == Some(plant_id))
        .collect();

    let mut removed = 0;
    for sub in &ours {
        match delete(client, plant_id, &sub.id).await {
            Ok(()) => removed += 1,
            Err(e) if e.is_account_wide() => return Err(e),
            Err(e) => warn!(subscription = %sub.id, error = %e, "could not delete orphaned subscription"),
        }
    }
    info!(plant = %plant_id, found = ours.len(), removed, "orphaned subscriptions cleaned up");
    Ok(removed)
}

/// Subscribe, and on conflict clean up our stale registrations and subscribe
/// once more.
pub async fn ensure_subscription(client: &ApiClient, plant_id: &str, endpoint_url: &str) -> Result<String> {
    if let SubscribeOutcome::Created(id) = subscribe(client, plant_id, endpoint_url).await? {
        return Ok(id);
    }
    cleanup_orphans(client, plant_id).await?;
    match subscribe(client, plant_id, endpoint_url).await? {
        SubscribeOutcome::Created(id) => Ok(id),
        SubscribeOutcome::Conflict => Err(Error::Api {
            status: 409,
            message: format!("subscription for plant {plant_id} still conflicts after cleanup"),
        }),
    }
}

/// A bare list, or the list under `subscriptions`.
fn parse_subscriptions(data: &Value) -> Vec<Subscription> {
    let items = data
        .as_array()
        .or_else(|| data.get("subscriptions").and_then(|s| s.as_array()));
    let Some(items) = items else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|s| {
            Some(Subscription {
                id: s.get("subscriptionId")?.as_str()?.to_string(),
                plant_id: s.get("plantId").and_then(|p| p.as_str()).map(str::to_string),
                endpoint_url: s
                    .get("EndPointUrl")
                    .and_then(|u| u.as_str())
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}
