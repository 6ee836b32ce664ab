use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::collector::Collector;
use crate::config::Config;
use crate::home_assistant::Discovery;
use crate::http_transport::HttpTransport;
use crate::merger::MergedRecord;
use crate::mqtt_wrapper::{LastWill, MqttWrapper, QoS};

pub const BACKOFF_BASE_SECS: u64 = 5;
pub const BACKOFF_MAX_SECS: u64 = 60;

const TICK: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    ShuttingDown,
}

/// Exponential reconnect delay: 5s, 10s, 20s, ... capped at 60s.
#[derive(Clone, Debug)]
pub struct Backoff {
    next: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: BACKOFF_BASE_SECS,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(BACKOFF_MAX_SECS);
        Duration::from_secs(delay)
    }
}

/// Waits one tick. Swapped out in tests so the loop runs without real time.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Availability message for the broker's last will.
pub fn last_will(config: &Config) -> LastWill {
    LastWill {
        topic: config.availability_topic(),
        payload: OFFLINE.to_string(),
        retain: true,
    }
}

pub struct Daemon<M: MqttWrapper, H: HttpTransport, S: Sleeper = ThreadSleeper> {
    mqtt: M,
    collectors: Vec<Collector<H>>,
    sleeper: S,
    shutdown: Arc<AtomicBool>,
    state: ConnectionState,
    base_topic: String,
    availability_topic: String,
    interval_secs: u64,
    discovery: Option<Discovery>,
    discovery_published: bool,
    dry_run: bool,
}

impl<M: MqttWrapper, H: HttpTransport + Clone, S: Sleeper> Daemon<M, H, S> {
    /// One collector per configured system, all sharing `http`. `shutdown`
    /// is the flag the signal handlers set.
    pub fn new(config: &Config, mqtt: M, http: H, sleeper: S, shutdown: Arc<AtomicBool>) -> Self {
        let collectors = config
            .system_ids
            .iter()
            .map(|system_id| {
                Collector::new(http.clone(), &config.http_url, system_id, config.credentials())
                    .with_auth_retries(config.auth_retries)
            })
            .collect();

        let discovery = config.ha_discovery_enabled.then(|| Discovery {
            prefix: config.ha_discovery_prefix.clone(),
            base_topic: config.mqtt_topic.clone(),
            availability_topic: config.availability_topic(),
            device_name: config.device_name.clone(),
        });

        Self {
            mqtt,
            collectors,
            sleeper,
            shutdown,
            state: ConnectionState::Disconnected,
            base_topic: config.mqtt_topic.clone(),
            availability_topic: config.availability_topic(),
            interval_secs: config.http_interval,
            discovery,
            discovery_published: false,
            dry_run: config.dry_run,
        }
    }
}

impl<M: MqttWrapper, H: HttpTransport, S: Sleeper> Daemon<M, H, S> {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Daemon state {:?} -> {state:?}", self.state);
            self.state = state;
        }
    }

    /// Runs until the shutdown flag is raised. In dry-run mode the broker is
    /// never contacted and everything that would be published is logged.
    pub fn run(&mut self) {
        if self.dry_run {
            info!("[DRY RUN] Skipping MQTT connection");
            if let Some(discovery) = self.discovery.clone() {
                self.log_discovery(&discovery);
            }
        } else if !self.connect_with_backoff() {
            info!("Stopping before MQTT connection established");
            self.set_state(ConnectionState::ShuttingDown);
            return;
        }
        info!("Starting daemon, fetching every {} seconds", self.interval_secs);

        while self.running() {
            if !self.dry_run && !self.mqtt.is_connected() {
                warn!("MQTT disconnected, attempting to reconnect...");
                self.set_state(ConnectionState::Disconnected);
                if !self.connect_with_backoff() {
                    break;
                }
            }

            self.handle_incoming();
            self.poll_once();
            self.sleep_ticks(self.interval_secs);
        }

        self.shut_down();
    }

    /// Tries the broker until it accepts the session. Returns false when
    /// shutdown was requested first.
    fn connect_with_backoff(&mut self) -> bool {
        let mut backoff = Backoff::default();
        while self.running() {
            match self.mqtt.connect(CONNECT_TIMEOUT) {
                Ok(()) => {
                    info!("Connected to MQTT broker");
                    self.set_state(ConnectionState::Connected);
                    self.on_connected();
                    return true;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        "MQTT connection failed ({e}), retrying in {} seconds...",
                        delay.as_secs()
                    );
                    if !self.sleep_ticks(delay.as_secs()) {
                        return false;
                    }
                }
            }
        }
        false
    }

    fn on_connected(&mut self) {
        self.publish_availability(ONLINE);

        let Some(discovery) = self.discovery.clone() else {
            return;
        };
        if let Err(e) = self.mqtt.subscribe(&discovery.birth_topic(), QoS::AtLeastOnce) {
            warn!("Subscription to {} failed: {e}", discovery.birth_topic());
        }
        if !self.discovery_published {
            info!("Publishing Home Assistant discovery messages...");
            self.publish_discovery(&discovery);
            self.discovery_published = true;
        }
    }

    fn publish_discovery(&mut self, discovery: &Discovery) {
        for collector in &self.collectors {
            discovery.publish(&mut self.mqtt, collector.system_id());
        }
    }

    fn log_discovery(&self, discovery: &Discovery) {
        for collector in &self.collectors {
            for (topic, sensor) in discovery.messages(collector.system_id()) {
                match serde_json::to_string(&sensor) {
                    Ok(payload) => info!("[DRY RUN] Would publish to {topic}: {payload}"),
                    Err(e) => error!("Failed to serialize discovery for {topic}: {e}"),
                }
            }
        }
    }

    // Home Assistant drops retained discovery state on restart and announces
    // itself with a birth message; answer it with a fresh discovery pass.
    fn handle_incoming(&mut self) {
        while let Some(message) = self.mqtt.try_recv() {
            let Some(discovery) = self.discovery.clone() else {
                continue;
            };
            if discovery.is_birth_message(&message.topic, &message.payload) {
                info!("Home Assistant came online, re-publishing discovery messages");
                self.publish_discovery(&discovery);
            }
        }
    }

    /// Fetches and publishes every system once. A system without data is
    /// skipped for this cycle.
    pub fn poll_once(&mut self) {
        debug!("Starting fetch cycle");
        for collector in &mut self.collectors {
            let topic = format!("{}/{}", self.base_topic, collector.system_id());
            match collector.fetch_all() {
                Some(record) => publish_record(&mut self.mqtt, &topic, &record, self.dry_run),
                None => warn!(
                    "No data to publish for system {} (all endpoints failed or returned empty)",
                    collector.system_id()
                ),
            }
        }
    }

    /// Sleeps `seconds` one tick at a time. Returns false as soon as shutdown
    /// is requested.
    fn sleep_ticks(&mut self, seconds: u64) -> bool {
        for _ in 0..seconds {
            if !self.running() {
                return false;
            }
            self.sleeper.sleep(TICK);
            if self.state == ConnectionState::Connected {
                self.handle_incoming();
            }
        }
        self.running()
    }

    fn publish_availability(&mut self, payload: &str) {
        if let Err(e) = self.mqtt.publish(
            self.availability_topic.clone(),
            QoS::AtLeastOnce,
            true,
            payload,
        ) {
            error!("Failed to publish availability {payload}: {e:?}");
        }
    }

    fn shut_down(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        self.set_state(ConnectionState::ShuttingDown);
        if !was_connected {
            return;
        }
        self.publish_availability(OFFLINE);
        if let Err(e) = self.mqtt.disconnect(DISCONNECT_TIMEOUT) {
            warn!("Failed to disconnect from MQTT broker: {e:?}");
        }
        info!("Disconnected from MQTT broker");
    }
}

fn publish_record<M: MqttWrapper>(
    mqtt: &mut M,
    topic: &str,
    record: &MergedRecord,
    dry_run: bool,
) {
    let payload = match serde_json::to_string(record) {
        Ok(payload) => payload,
        Err(e) => {
            error!("Failed to serialize record for {topic}: {e}");
            return;
        }
    };
    if dry_run {
        info!("[DRY RUN] Would publish to {topic}: {payload}");
        return;
    }
    debug!("Publishing to {topic} with payload {payload}");
    match mqtt.publish(topic, QoS::AtMostOnce, false, payload) {
        Ok(()) => info!("Data published to {topic}"),
        Err(e) => error!("Failed to publish message: {e:?}"),
    }
}
