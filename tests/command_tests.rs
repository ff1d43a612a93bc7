mod common;

use std::sync::Arc;

use bticino_x8000::protocol::status_path;
use bticino_x8000::{
    CommandDispatcher, CommandIntent, DeviceStateTable, DeviceStatusSnapshot, Error, Function, HvacMode, LoadState,
    Mode, Source,
};
use chrono::NaiveDateTime;
use common::*;
use serde_json::Value;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn snapshot(function: Function, mode: Mode, program: Option<u32>) -> DeviceStatusSnapshot {
    DeviceStatusSnapshot {
        function,
        mode,
        load_state: LoadState::Inactive,
        set_point: Some(23.0),
        temperature: Some(25.0),
        humidity: None,
        program,
        boost: None,
    }
}

async fn setup(server: &MockServer) -> (CommandDispatcher, Arc<DeviceStateTable>) {
    Mock::given(method("POST"))
        .and(path(status_path(PLANT, "d1")))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
    let state = Arc::new(DeviceStateTable::new());
    let dispatcher = CommandDispatcher::new(client(server), registry(&["d1"]), state.clone());
    (dispatcher, state)
}

async fn sent_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.body_json::<Value>().unwrap())
        .collect()
}

#[tokio::test]
async fn set_temperature_preserves_cooling() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Cooling, Mode::Automatic, Some(2)), Source::Poll);

    let resp = dispatcher.apply("d1", CommandIntent::SetTemperature(21.5)).await.unwrap();
    assert_eq!(resp.status, 200);

    let bodies = sent_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["function"], "cooling");
    assert_eq!(bodies[0]["mode"], "manual");
    assert_eq!(bodies[0]["setPoint"]["value"], 21.5);
}

#[tokio::test]
async fn commands_leave_state_untouched() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Heating, Mode::Automatic, Some(2)), Source::Poll);

    dispatcher.apply("d1", CommandIntent::SetMode(HvacMode::Off)).await.unwrap();

    let current = state.get("d1").unwrap();
    assert_eq!(current.mode, Mode::Automatic);
    assert_eq!(state.entry("d1").unwrap().source, Source::Poll);
}

#[tokio::test]
async fn auto_mode_keeps_active_program() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Heating, Mode::Manual, Some(2)), Source::Webhook);

    dispatcher.apply("d1", CommandIntent::SetMode(HvacMode::Auto)).await.unwrap();
    let body = &sent_bodies(&server).await[0];
    assert_eq!(body["mode"], "automatic");
    assert_eq!(body["programs"][0]["number"], 2);
}

#[tokio::test]
async fn heat_without_snapshot_uses_defaults() {
    let server = MockServer::start().await;
    let (dispatcher, _) = setup(&server).await;

    dispatcher.apply("d1", CommandIntent::SetMode(HvacMode::Heat)).await.unwrap();
    let body = &sent_bodies(&server).await[0];
    assert_eq!(body["function"], "heating");
    assert_eq!(body["mode"], "manual");
    assert_eq!(body["setPoint"]["value"], 20.0);
}

#[tokio::test]
async fn cool_keeps_current_set_point() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Heating, Mode::Manual, None), Source::Poll);

    dispatcher.apply("d1", CommandIntent::SetMode(HvacMode::Cool)).await.unwrap();
    let body = &sent_bodies(&server).await[0];
    assert_eq!(body["function"], "cooling");
    assert_eq!(body["setPoint"]["value"], 23.0);
}

#[tokio::test]
async fn boost_carries_activation_window() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Heating, Mode::Automatic, Some(1)), Source::Poll);

    dispatcher.apply("d1", CommandIntent::SetBoost(60)).await.unwrap();
    let body = &sent_bodies(&server).await[0];
    assert_eq!(body["mode"], "boost");
    assert_eq!(body["setPoint"]["value"], 40.0);

    let window = body["activationTime"].as_str().unwrap();
    let (start, end) = window.split_once('/').unwrap();
    let start = NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%M:%S").unwrap();
    let end = NaiveDateTime::parse_from_str(end, "%Y-%m-%dT%H:%M:%S").unwrap();
    assert_eq!((end - start).num_minutes(), 60);
}

#[tokio::test]
async fn cancel_boost_returns_to_first_catalog_program() {
    let server = MockServer::start().await;
    let (dispatcher, state) = setup(&server).await;
    state.replace("d1", snapshot(Function::Cooling, Mode::Boost, None), Source::Poll);

    dispatcher.apply("d1", CommandIntent::CancelBoost).await.unwrap();
    let body = &sent_bodies(&server).await[0];
    assert_eq!(body["function"], "cooling");
    assert_eq!(body["mode"], "automatic");
    assert_eq!(body["programs"][0]["number"], 1);
}

#[tokio::test]
async fn program_must_exist_in_catalog() {
    let server = MockServer::start().await;
    let (dispatcher, _) = setup(&server).await;

    let err = dispatcher.apply("d1", CommandIntent::SetProgram(9)).await.unwrap_err();
    assert!(matches!(err, Error::UnknownProgram(9)));
    assert!(sent_bodies(&server).await.is_empty());

    dispatcher.apply("d1", CommandIntent::SetProgram(2)).await.unwrap();
    assert_eq!(sent_bodies(&server).await[0]["programs"][0]["number"], 2);
}

#[tokio::test]
async fn unknown_device_rejected() {
    let server = MockServer::start().await;
    let (dispatcher, _) = setup(&server).await;

    let err = dispatcher.apply("nope", CommandIntent::SetTemperature(20.0)).await.unwrap_err();
    assert!(matches!(err, Error::UnknownDevice(ref id) if id == "nope"));
    assert!(sent_bodies(&server).await.is_empty());
}

#[tokio::test]
async fn rate_limited_command_surfaces_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429))
        .expect(1)
        .mount(&server)
        .await;
    let dispatcher = CommandDispatcher::new(client(&server), registry(&["d1"]), Arc::new(DeviceStateTable::new()));

    let err = dispatcher.apply("d1", CommandIntent::SetTemperature(20.0)).await.unwrap_err();
    assert!(err.is_rate_limited());
}
