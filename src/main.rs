use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use courier::config::load_config;
use courier::cqrs::{CommandBus, CommandProcessor, JsonMarshaler, command_handler};
use courier::metrics::MetricsBuilder;
use courier::router::middleware::{Retry, correlation_id};
use courier::router::plugin::signals_handler;
use courier::utils::logging;
use courier::{BrokerConfig, InMemoryBroker, Result, Router, RouterConfig, Scope, Subscriber};

/// Runs a demo router on the in-memory broker until Ctrl-C.
#[derive(Debug, Parser)]
#[command(name = "courier", version, about)]
struct Cli {
    /// Overrides the configured log level.
    #[arg(long, env = "COURIER_LOG_LEVEL")]
    log_level: Option<String>,

    /// Delay between two demo commands, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    name: String,
    sequence: u64,
}

fn command_topic(name: &str) -> String {
    format!("commands.{name}")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let settings = load_config()?;
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.logging.level));

    let broker = InMemoryBroker::new(BrokerConfig::from(&settings.broker));
    let router = Router::new(RouterConfig::from(&settings.router))?;
    router.add_plugin([signals_handler()]);
    router.add_middleware([correlation_id(), Retry::default().middleware()]);
    MetricsBuilder::new("courier", "demo").add_metrics_router_decorator(&router);

    let mut processor = CommandProcessor::builder()
        .with_generate_topic(command_topic)
        .with_subscriber_constructor({
            let broker = broker.clone();
            move |_handler_name: &str| -> Result<Arc<dyn Subscriber>> { Ok(Arc::new(broker.clone())) }
        })
        .with_marshaler(JsonMarshaler::default())
        .build()?;
    processor.add_handler(command_handler("greeter", |_scope: Scope, greet: Greet| async move {
        info!(name = %greet.name, sequence = greet.sequence, "Hello");
        Ok(())
    }))?;
    processor.add_handlers_to_router(&router)?;

    let bus = CommandBus::builder()
        .with_publisher(Arc::new(broker.clone()))
        .with_generate_topic(command_topic)
        .with_marshaler(JsonMarshaler::default())
        .build()?;

    let ticker = {
        let router = router.clone();
        let interval = Duration::from_millis(cli.interval_ms.max(1));
        tokio::spawn(async move {
            router.running().await;
            let mut ticks = tokio::time::interval(interval);
            let mut sequence = 0;
            while !router.is_closed() {
                ticks.tick().await;
                sequence += 1;
                let greet = Greet {
                    name: "courier".to_string(),
                    sequence,
                };
                if let Err(err) = bus.send(&Scope::new(), &greet).await {
                    if !router.is_closed() {
                        error!(error = %err, "Cannot send demo command");
                    }
                    break;
                }
            }
        })
    };

    let result = router.run(Scope::new()).await;
    ticker.abort();
    info!("Courier stopped");
    result
}
