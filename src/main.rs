use mux_echo::config::Config;
use mux_echo::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_names(true)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        poll_timeout_ms = config.poll_timeout.as_millis() as u64,
        max_events = config.max_events,
        "Starting mux-echo server"
    );

    runtime::run(&config)?;
    Ok(())
}
