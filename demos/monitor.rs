use std::env;
use std::time::Duration;

use bticino_x8000::{ConfigHandle, Integration, JsonFileConfigStore, MessageLogMode};

#[tokio::main]
async fn main() -> bticino_x8000::Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let config_path = args
        .get(1)
        .expect("usage: monitor <config.json> [--log <traffic.ndjson>] [--subscribe]");
    let log_path = args
        .iter()
        .position(|a| a == "--log")
        .and_then(|i| args.get(i + 1));
    let subscribe = args.iter().any(|a| a == "--subscribe");

    let config = ConfigHandle::new(JsonFileConfigStore::new(config_path));
    let mut builder = Integration::builder(config).on_event(|event| {
        println!("{event:?}");
    });
    if let Some(path) = log_path {
        builder = builder.message_log(MessageLogMode::Full, path.clone());
    }
    let integration = builder.build()?;

    if subscribe {
        let n = integration.subscribe_webhooks().await?;
        println!("{n} webhook subscription(s) active");
    }

    let state = integration.state().clone();
    let registry = integration.registry().clone();
    let printer = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(30)).await;
            for device in registry.devices() {
                match state.get(&device.device_id) {
                    Some(s) => println!(
                        "[{}] {:?} {:?} | {:?} | set {:?}\u{00b0}C | now {:?}\u{00b0}C | {:?}%",
                        device.display_name,
                        s.function,
                        s.mode,
                        s.action(),
                        s.set_point,
                        s.temperature,
                        s.humidity,
                    ),
                    None => println!("[{}] unavailable", device.display_name),
                }
            }
        }
    });

    println!("Polling. Ctrl-C to stop.");
    integration
        .coordinator()
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    printer.abort();

    if subscribe {
        integration.unload().await?;
    }
    println!("{:?}", integration.client().stats());
    Ok(())
}
