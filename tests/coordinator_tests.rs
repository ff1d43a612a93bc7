mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bticino_x8000::protocol::status_path;
use bticino_x8000::{
    ConfigHandle, CoordinatorEvent, DeviceStateTable, Error, MemoryConfigStore, Mode, Options, PollCoordinator,
    PollOutcome, Source,
};
use common::*;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const FIFTEEN_MIN: Duration = Duration::from_secs(15 * 60);
const SIXTY_MIN: Duration = Duration::from_secs(60 * 60);

async fn mount_status(server: &MockServer, id: &str, status: u16, expect: u64) {
    let template = if status == 200 {
        ResponseTemplate::new(200).set_body_json(status_body(id))
    } else {
        ResponseTemplate::new(status)
    };
    Mock::given(method("GET"))
        .and(path(status_path(PLANT, id)))
        .respond_with(template)
        .expect(expect)
        .mount(server)
        .await;
}

type Events = Arc<Mutex<Vec<CoordinatorEvent>>>;

fn coordinator(server: &MockServer, ids: &[&str], options: Options) -> (PollCoordinator, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let coordinator = PollCoordinator::builder(client(server), registry(ids), Arc::new(DeviceStateTable::new()))
        .options(options)
        .on_event(move |e| sink.lock().unwrap().push(e.clone()))
        .build();
    (coordinator, events)
}

#[tokio::test]
async fn rate_limit_aborts_rest_of_batch() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 200, 1).await;
    mount_status(&server, "d2", 429, 1).await;
    for id in ["d3", "d4", "d5"] {
        mount_status(&server, id, 200, 0).await;
    }

    let (coordinator, events) = coordinator(&server, &["d1", "d2", "d3", "d4", "d5"], Options::default());
    let report = coordinator.poll_once().await.unwrap();

    assert_eq!(report.outcome, PollOutcome::RateLimited);
    assert_eq!(report.updated, vec!["d1"]);
    assert_eq!(report.not_polled, vec!["d3", "d4", "d5"]);
    assert!(coordinator.is_cooling_down());
    assert_eq!(coordinator.current_interval(), SIXTY_MIN);

    let events = events.lock().unwrap();
    assert!(matches!(
        &events[0],
        CoordinatorEvent::RateLimitExceeded { device_id, cool_down, .. }
            if device_id == "d2" && *cool_down == SIXTY_MIN
    ));
    assert!(matches!(events[1], CoordinatorEvent::Notification { .. }));
}

#[tokio::test]
async fn first_success_after_cooldown_recovers() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 429, 1).await;

    let (coordinator, events) = coordinator(&server, &["d1", "d2", "d3"], Options::default());
    coordinator.poll_once().await.unwrap();
    assert!(coordinator.is_cooling_down());

    server.reset().await;
    mount_status(&server, "d1", 200, 1).await;
    mount_status(&server, "d2", 500, 3).await;
    mount_status(&server, "d3", 200, 1).await;

    let report = coordinator.poll_once().await.unwrap();
    assert_eq!(report.outcome, PollOutcome::Completed);
    assert!(!coordinator.is_cooling_down());
    assert_eq!(coordinator.current_interval(), FIFTEEN_MIN);
    assert_eq!(report.updated, vec!["d1", "d3"]);
    assert_eq!(report.skipped.len(), 1);

    let events = events.lock().unwrap();
    assert!(events.contains(&CoordinatorEvent::Recovered));
    assert_eq!(events.last(), Some(&CoordinatorEvent::NotificationDismissed));
}

#[tokio::test]
async fn malformed_success_still_ends_cooldown() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 429, 1).await;

    let (coordinator, events) = coordinator(&server, &["d1"], Options::default());
    coordinator.poll_once().await.unwrap();
    assert!(coordinator.is_cooling_down());

    server.reset().await;
    Mock::given(method("GET"))
        .and(path(status_path(PLANT, "d1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "unexpected": true })))
        .expect(1)
        .mount(&server)
        .await;

    let report = coordinator.poll_once().await.unwrap();
    assert_eq!(report.outcome, PollOutcome::Completed);
    assert!(report.updated.is_empty());
    assert_eq!(report.skipped.len(), 1);
    assert!(!coordinator.is_cooling_down());
    assert_eq!(coordinator.current_interval(), FIFTEEN_MIN);
    assert!(events.lock().unwrap().contains(&CoordinatorEvent::Recovered));
}

#[tokio::test]
async fn one_success_one_rate_limit() {
    let server = MockServer::start().await;
    mount_status(&server, "a", 200, 1).await;
    mount_status(&server, "b", 429, 1).await;

    let options = Options {
        update_interval: 15,
        cool_down_interval: 60,
        ..Options::default()
    };
    let (coordinator, _) = coordinator(&server, &["a", "b"], options);
    coordinator.poll_once().await.unwrap();

    let state = coordinator.state();
    assert_eq!(state.len(), 1);
    let a = state.entry("a").unwrap();
    assert_eq!(a.source, Source::Poll);
    assert_eq!(a.snapshot.mode, Mode::Automatic);
    assert_eq!(a.snapshot.temperature, Some(19.5));
    assert!(state.get("b").is_none());

    assert!(coordinator.is_cooling_down());
    assert_eq!(coordinator.current_interval(), SIXTY_MIN);
    assert_eq!(coordinator.client().stats().rate_limited, 1);
}

#[tokio::test]
async fn device_errors_do_not_abort_batch() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 404, 1).await;
    Mock::given(method("GET"))
        .and(path(status_path(PLANT, "d2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "chronothermostats": [{ "mode": "manual" }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_status(&server, "d3", 200, 1).await;

    let (coordinator, events) = coordinator(&server, &["d1", "d2", "d3"], Options::default());
    let report = coordinator.poll_once().await.unwrap();

    assert_eq!(report.outcome, PollOutcome::Completed);
    assert_eq!(report.updated, vec!["d3"]);
    let skipped: Vec<_> = report.skipped.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(skipped, vec!["d1", "d2"]);
    assert!(!coordinator.is_cooling_down());
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn auth_failure_stops_polling_until_forced_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;
    mount_status(&server, "d1", 200, 0).await;
    mount_status(&server, "d2", 200, 0).await;

    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let coordinator = PollCoordinator::builder(
        client_with(&server, expired_credential(), fast_policy()),
        registry(&["d1", "d2"]),
        Arc::new(DeviceStateTable::new()),
    )
    .on_event(move |e| sink.lock().unwrap().push(e.clone()))
    .build();

    let report = coordinator.poll_once().await.unwrap();
    assert_eq!(report.outcome, PollOutcome::AuthFailed);
    assert_eq!(report.not_polled, vec!["d2"]);
    assert!(coordinator.client().is_auth_broken());
    assert!(matches!(
        &events.lock().unwrap()[0],
        CoordinatorEvent::AuthBroken { device_id, .. } if device_id == "d1"
    ));

    let err = coordinator.poll_once().await.unwrap_err();
    assert!(matches!(err, Error::AuthBroken));
    server.verify().await;

    server.reset().await;
    mount_token_ok(&server, "tok-2").await;
    mount_status(&server, "d1", 200, 1).await;
    mount_status(&server, "d2", 200, 1).await;

    assert!(coordinator.force_token_refresh().await);
    assert!(!coordinator.client().is_auth_broken());
    let report = coordinator.poll_once().await.unwrap();
    assert_eq!(report.updated, vec!["d1", "d2"]);
    assert!(!coordinator.is_cooling_down());
}

#[tokio::test]
async fn failed_forced_refresh_keeps_flag() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let client = client_with(&server, expired_credential(), fast_policy());
    let coordinator =
        PollCoordinator::builder(client, registry(&["d1"]), Arc::new(DeviceStateTable::new())).build();
    coordinator.poll_once().await.unwrap();
    assert!(coordinator.client().is_auth_broken());

    assert!(!coordinator.force_token_refresh().await);
    assert!(coordinator.client().is_auth_broken());
}

#[tokio::test]
async fn notifications_follow_option() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 429, 1).await;

    let options = Options {
        notify_errors: false,
        ..Options::default()
    };
    let (coordinator, events) = coordinator(&server, &["d1"], options);
    coordinator.poll_once().await.unwrap();

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(matches!(events[0], CoordinatorEvent::RateLimitExceeded { .. }));
}

#[tokio::test]
async fn interval_setters_apply_and_persist() {
    let server = MockServer::start().await;
    let config = ConfigHandle::new(MemoryConfigStore::new(stored_config(&server, &["d1"])));
    let coordinator = PollCoordinator::builder(client(&server), registry(&["d1"]), Arc::new(DeviceStateTable::new()))
        .config(config.clone())
        .build();

    coordinator.set_update_interval(5).unwrap();
    assert_eq!(coordinator.current_interval(), Duration::from_secs(5 * 60));
    coordinator.set_cool_down_interval(30).unwrap();
    coordinator.set_notify_errors(false).unwrap();

    let stored = config.load().unwrap();
    assert_eq!(stored.options.update_interval, 5);
    assert_eq!(stored.options.cool_down_interval, 30);
    assert!(!stored.options.notify_errors);

    let err = coordinator.set_update_interval(0).unwrap_err();
    assert!(matches!(err, Error::InvalidOption { name: "update_interval", .. }));
    assert!(coordinator.set_cool_down_interval(500).is_err());
    assert_eq!(config.load().unwrap().options.update_interval, 5);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let server = MockServer::start().await;
    mount_status(&server, "d1", 200, 1).await;

    let (coordinator, _) = coordinator(&server, &["d1"], Options::default());
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let runner = async {
        coordinator
            .run(async {
                let _ = rx.await;
            })
            .await
    };
    let stopper = async {
        while coordinator.state().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = tx.send(());
    };
    tokio::join!(runner, stopper);
    assert!(coordinator.state().get("d1").is_some());
}
