mod logging;
mod rumqttc_wrapper;

use hypon2mqtt::config::Config;
use hypon2mqtt::daemon::{self, Daemon, ThreadSleeper};
use hypon2mqtt::http_transport::ReqwestTransport;
use hypon2mqtt::mqtt_wrapper::MqttWrapper;
use rumqttc_wrapper::RumqttcWrapper;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{error, info, warn};

// configuration file from $CONFIG_FILE, the current working dir, or next to the executable
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CONFIG_FILE") {
        return Some(PathBuf::from(path));
    }
    let mut path = std::env::current_dir().ok()?;
    path.push("config.toml");
    if path.exists() {
        return Some(path);
    }
    info!("{} does not exist. Trying relative path", path.display());
    let mut path = std::env::current_exe().ok()?;
    path.pop();
    path.push("config.toml");
    path.exists().then_some(path)
}

fn load_config() -> anyhow::Result<Config> {
    let config = match config_path() {
        Some(path) => {
            info!("loading configuration from {}", path.display());
            Config::load(&path.to_string_lossy())?
        }
        None => {
            info!("no config.toml found, configuring from environment");
            Config::from_env()?
        }
    };
    Ok(config)
}

fn main() {
    logging::init_logger();
    info!("Running revision: {}", env!("GIT_HASH"));
    if std::env::args().len() > 1 {
        error!("Arguments passed. Tool is configured by config.toml and environment variables");
    }

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            process::exit(1);
        }
    };
    info!("API base URL: {}", config.http_url);
    info!("Monitoring systems: {}", config.system_ids.join(", "));
    if config.credentials().is_none() {
        warn!("No API credentials provided");
    }
    if !config.verify_ssl {
        warn!("TLS certificate verification for the API is disabled");
    }
    if config.dry_run {
        warn!("Dry run: data is fetched and logged, nothing is sent to the MQTT broker");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            error!("Could not register handler for signal {signal}: {e}");
            process::exit(1);
        }
    }

    let http = match ReqwestTransport::new(config.verify_ssl, config.timeout()) {
        Ok(http) => http,
        Err(e) => {
            error!("Could not set up HTTP client: {e}");
            process::exit(1);
        }
    };

    info!(
        "MQTT broker: {}:{} (TLS {})",
        config.mqtt.host,
        config.mqtt.port(),
        if config.mqtt.use_tls() { "on" } else { "off" }
    );
    let mqtt = RumqttcWrapper::new(&config.mqtt, Some(daemon::last_will(&config)));

    if config.ha_discovery_enabled {
        info!("Publishing to Home Assistant under {}", config.ha_discovery_prefix);
    }

    let mut daemon = Daemon::new(&config, mqtt, http, ThreadSleeper, shutdown);
    daemon.run();
    info!("Daemon stopped");
}
