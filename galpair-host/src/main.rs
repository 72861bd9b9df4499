use clap::Parser;
use galpair_host::{
    AppState, DispatcherConfig,
    dispatcher::{DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_NOTIFICATION_BUFFER},
    serve,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "galpair-host")]
struct HostArgs {
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind_address: String,

    /// Inbound events that may wait for the dispatcher before submitters block.
    #[arg(long, default_value_t = DEFAULT_EVENT_QUEUE_CAPACITY)]
    event_queue_capacity: usize,

    /// Notifications kept for slow presentation clients before they start skipping.
    #[arg(long, default_value_t = DEFAULT_NOTIFICATION_BUFFER)]
    notification_buffer: usize,
}

impl HostArgs {
    fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            event_queue_capacity: self.event_queue_capacity,
            notification_buffer: self.notification_buffer,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = HostArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    info!(
        "pairing host starting on {} (event queue {}, notification buffer {})",
        args.bind_address, args.event_queue_capacity, args.notification_buffer
    );
    if let Err(err) = serve(listener, AppState::new(args.dispatcher_config())).await {
        warn!("pairing host exited: {}", err);
    }
}
