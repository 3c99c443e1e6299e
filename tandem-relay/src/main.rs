use log::info;

use tandem_relay::{RelayConfig, RelayServer};

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let defaults = RelayConfig::default();
    let config = RelayConfig {
        bind_addr: std::env::var("TANDEM_BIND_ADDR").unwrap_or(defaults.bind_addr),
        heartbeat_interval_secs: env_u64(
            "TANDEM_HEARTBEAT_SECS",
            defaults.heartbeat_interval_secs,
        ),
        idle_room_grace_secs: env_u64("TANDEM_ROOM_GRACE_SECS", defaults.idle_room_grace_secs),
        allow_default_room: std::env::var("TANDEM_ALLOW_DEFAULT_ROOM")
            .map(|v| v != "0" && v != "false")
            .unwrap_or(defaults.allow_default_room),
    };

    info!("Starting tandem-relay on {}", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay terminated: {e}");
        std::process::exit(1);
    }
}
