#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bticino_x8000::{
    ApiClient, Credential, DeviceIdentity, DeviceRegistry, Options, Program, RetryPolicy, SelectedThermostat,
    StoredConfig, TokenEndpoint, TokenStore,
};
use chrono::{TimeDelta, Utc};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const PLANT: &str = "plant-1";

/// Retries without the production delays.
pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(10),
        min_spacing: Duration::ZERO,
        ..RetryPolicy::default()
    }
}

pub fn credential(access_token: &str, valid_for_secs: i64) -> Credential {
    Credential {
        access_token: access_token.to_string(),
        refresh_token: "refresh-1".to_string(),
        expires_at: Utc::now() + TimeDelta::seconds(valid_for_secs),
    }
}

pub fn fresh_credential() -> Credential {
    credential("tok-1", 3600)
}

pub fn expired_credential() -> Credential {
    credential("tok-1", -60)
}

pub fn token_store(server: &MockServer, credential: Credential) -> Arc<TokenStore> {
    Arc::new(TokenStore::new(
        reqwest::Client::new(),
        TokenEndpoint {
            auth_base_url: server.uri(),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        },
        credential,
    ))
}

pub fn client_with(server: &MockServer, credential: Credential, policy: RetryPolicy) -> Arc<ApiClient> {
    let client = ApiClient::builder(token_store(server, credential), "sub-key")
        .base_url(server.uri())
        .retry_policy(policy)
        .build()
        .unwrap();
    Arc::new(client)
}

pub fn client(server: &MockServer) -> Arc<ApiClient> {
    client_with(server, fresh_credential(), fast_policy())
}

pub async fn mount_token_ok(server: &MockServer, access_token: &str) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": access_token,
            "refresh_token": "refresh-2",
            "expires_in": 3600
        })))
        .mount(server)
        .await;
}

pub fn device(id: &str) -> DeviceIdentity {
    DeviceIdentity {
        plant_id: PLANT.to_string(),
        device_id: id.to_string(),
        display_name: format!("Thermostat {id}"),
        programs: vec![
            Program { number: 1, name: "Winter".to_string() },
            Program { number: 2, name: "Holiday".to_string() },
        ],
    }
}

pub fn registry(ids: &[&str]) -> Arc<DeviceRegistry> {
    Arc::new(DeviceRegistry::new(ids.iter().map(|id| device(id))))
}

/// One full status object as the upstream reports it.
pub fn status_object(id: &str, function: &str, mode: &str) -> Value {
    json!({
        "function": function,
        "mode": mode,
        "loadState": "ACTIVE",
        "setPoint": { "value": "21.0", "unit": "C" },
        "programs": [{ "number": 2 }],
        "thermometer": { "measures": [{ "value": "19.5", "unit": "C" }] },
        "hygrometer": { "measures": [{ "value": "45", "unit": "%" }] },
        "sender": { "plant": { "id": PLANT, "module": { "id": id } } }
    })
}

pub fn status_body(id: &str) -> Value {
    json!({ "chronothermostats": [status_object(id, "heating", "automatic")] })
}

pub fn stored_config(server: &MockServer, ids: &[&str]) -> StoredConfig {
    StoredConfig {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        subscription_key: "sub-key".to_string(),
        api_base_url: server.uri(),
        auth_base_url: server.uri(),
        external_url: Some("https://home.example.org".to_string()),
        access_token: "Bearer tok-1".to_string(),
        refresh_token: "refresh-1".to_string(),
        access_token_expires_on: Some(Utc::now() + TimeDelta::seconds(3600)),
        selected_thermostats: ids
            .iter()
            .map(|id| SelectedThermostat {
                plant_id: PLANT.to_string(),
                id: id.to_string(),
                name: format!("Thermostat {id}"),
                programs: Vec::new(),
                webhook_id: format!("hook-{id}"),
                subscription_id: None,
            })
            .collect(),
        options: Options::default(),
    }
}
