use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use hypon2mqtt::config::Config;
use hypon2mqtt::daemon::{ConnectionState, Daemon, Sleeper};
use hypon2mqtt::http_transport::{HttpResponse, HttpTransport, TransportError};
use hypon2mqtt::mqtt_config::MqttConfig;
use hypon2mqtt::mqtt_wrapper::{IncomingMessage, LastWill, MqttWrapper, QoS};
use serde_json::{json, Value};

const LOGIN: &str = "http://api.test/v2/login";
const MONITOR: &str = "http://api.test/v2/plant/42/monitor?refresh=true";
const PRODUCTION: &str = "http://api.test/v2/plant/42/production2";
const STATUS: &str = "http://api.test/v2/plant/42/status";

const DISCOVERY_SENSORS: usize = 24;

#[derive(Default)]
struct Broker {
    refuse_connects: VecDeque<bool>,
    refuse_by_default: bool,
    connected: bool,
    connect_attempts: u32,
    // ticks slept after each connect attempt
    ticks_after_attempt: Vec<u64>,
    published: Vec<(String, Vec<u8>, bool)>,
    subscriptions: Vec<String>,
    inbox: VecDeque<IncomingMessage>,
    disconnects: u32,
}

#[derive(Clone, Default)]
struct MqttTester {
    broker: Arc<Mutex<Broker>>,
}

impl MqttTester {
    fn refusing(times: usize) -> Self {
        let tester = Self::default();
        tester
            .broker
            .lock()
            .unwrap()
            .refuse_connects
            .extend(std::iter::repeat(true).take(times));
        tester
    }

    fn unreachable() -> Self {
        let tester = Self::default();
        tester.broker.lock().unwrap().refuse_by_default = true;
        tester
    }

    fn published(&self) -> Vec<(String, String, bool)> {
        self.broker
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(t, p, r)| (t.clone(), String::from_utf8_lossy(p).into_owned(), *r))
            .collect()
    }

    fn published_to(&self, topic: &str) -> Vec<String> {
        self.published()
            .into_iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p)
            .collect()
    }

    fn discovery_count(&self) -> usize {
        self.published()
            .iter()
            .filter(|(t, _, _)| t.starts_with("homeassistant/sensor/"))
            .count()
    }
}

impl MqttWrapper for MqttTester {
    fn connect(&mut self, _timeout: Duration) -> anyhow::Result<()> {
        let mut broker = self.broker.lock().unwrap();
        broker.connect_attempts += 1;
        broker.ticks_after_attempt.push(0);
        let default = broker.refuse_by_default;
        if broker.refuse_connects.pop_front().unwrap_or(default) {
            bail!("connection refused");
        }
        broker.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.broker.lock().unwrap().connected
    }

    fn subscribe(&mut self, topic: &str, _qos: QoS) -> anyhow::Result<()> {
        self.broker
            .lock()
            .unwrap()
            .subscriptions
            .push(topic.to_string());
        Ok(())
    }

    fn publish<S, V>(&mut self, topic: S, _qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        let mut broker = self.broker.lock().unwrap();
        if !broker.connected {
            bail!("not connected");
        }
        broker
            .published
            .push((topic.into(), payload.into(), retain));
        Ok(())
    }

    fn try_recv(&mut self) -> Option<IncomingMessage> {
        self.broker.lock().unwrap().inbox.pop_front()
    }

    fn disconnect(&mut self, _timeout: Duration) -> anyhow::Result<()> {
        let mut broker = self.broker.lock().unwrap();
        broker.connected = false;
        broker.disconnects += 1;
        Ok(())
    }

    fn new(_config: &MqttConfig, _last_will: Option<LastWill>) -> Self {
        Self::default()
    }
}

enum Action {
    DropConnection,
    Deliver(&'static str, &'static str),
    Shutdown,
}

/// Counts ticks instead of sleeping and plays scripted events at given ticks.
struct TickScript {
    broker: Arc<Mutex<Broker>>,
    shutdown: Arc<AtomicBool>,
    ticks: Arc<Mutex<u64>>,
    script: Vec<(u64, Action)>,
}

impl Sleeper for TickScript {
    fn sleep(&mut self, duration: Duration) {
        assert_eq!(duration, Duration::from_secs(1));
        let tick = {
            let mut ticks = self.ticks.lock().unwrap();
            *ticks += 1;
            *ticks
        };
        let mut broker = self.broker.lock().unwrap();
        if let Some(last) = broker.ticks_after_attempt.last_mut() {
            *last += 1;
        }
        for (at, action) in &self.script {
            if *at != tick {
                continue;
            }
            match action {
                Action::DropConnection => broker.connected = false,
                Action::Deliver(topic, payload) => broker.inbox.push_back(IncomingMessage {
                    topic: topic.to_string(),
                    payload: payload.as_bytes().to_vec(),
                }),
                Action::Shutdown => self.shutdown.store(true, Ordering::SeqCst),
            }
        }
    }
}

#[derive(Default)]
struct Api {
    responses: HashMap<String, VecDeque<String>>,
    calls: Vec<(String, Option<String>)>,
}

/// Replays bodies per URL; the last scripted body keeps being returned.
#[derive(Clone, Default)]
struct FakeApi {
    api: Arc<Mutex<Api>>,
}

impl FakeApi {
    fn healthy() -> Self {
        FakeApi::default()
            .with(LOGIN, r#"{"code":20000,"data":{"token":"t1"}}"#)
            .with(MONITOR, r#"{"code":20000,"data":{"percent":5.39,"power_pv":41}}"#)
            .with(PRODUCTION, r#"{"code":20000,"data":{"today_generation":0.02,"co2":2.83}}"#)
            .with(STATUS, r#"{"code":20000,"data":{"gateway":{"online":1}}}"#)
    }

    fn with(self, url: &str, body: &str) -> Self {
        self.api
            .lock()
            .unwrap()
            .responses
            .entry(url.to_string())
            .or_default()
            .push_back(body.to_string());
        self
    }

    fn calls_to(&self, url: &str) -> Vec<Option<String>> {
        self.api
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, bearer)| bearer.clone())
            .collect()
    }

    fn answer(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, TransportError> {
        let mut api = self.api.lock().unwrap();
        api.calls
            .push((url.to_string(), bearer.map(str::to_string)));
        let queue = api
            .responses
            .get_mut(url)
            .ok_or_else(|| TransportError::Connect(format!("{url} unreachable")))?;
        let body = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        body.map(|body| HttpResponse { status: 200, body })
            .ok_or_else(|| TransportError::Connect(format!("{url} unreachable")))
    }
}

impl HttpTransport for FakeApi {
    fn post_json(&self, url: &str, _body: &Value) -> Result<HttpResponse, TransportError> {
        self.answer(url, None)
    }

    fn get(&self, url: &str, bearer: Option<&str>) -> Result<HttpResponse, TransportError> {
        self.answer(url, bearer)
    }
}

fn config(discovery: bool, interval: u64) -> Config {
    let config = Config::from_toml(&format!(
        r#"
        http_url = "http://api.test/v2"
        api_username = "user"
        api_password = "secret"
        system_ids = ["42"]
        http_interval = {interval}
        mqtt_topic = "hypon"
        ha_discovery_enabled = {discovery}

        [mqtt]
        host = "broker.test"
        "#
    ))
    .unwrap();
    config.validate().unwrap();
    config
}

struct Harness {
    daemon: Daemon<MqttTester, FakeApi, TickScript>,
    mqtt: MqttTester,
    ticks: Arc<Mutex<u64>>,
}

fn harness(config: &Config, mqtt: MqttTester, api: FakeApi, script: Vec<(u64, Action)>) -> Harness {
    let shutdown = Arc::new(AtomicBool::new(false));
    let ticks = Arc::new(Mutex::new(0));
    let sleeper = TickScript {
        broker: Arc::clone(&mqtt.broker),
        shutdown: Arc::clone(&shutdown),
        ticks: Arc::clone(&ticks),
        script,
    };
    let daemon = Daemon::new(config, mqtt.clone(), api, sleeper, shutdown);
    Harness {
        daemon,
        mqtt,
        ticks,
    }
}

#[test]
fn publishes_merged_record_between_availability_messages() {
    let api = FakeApi::healthy();
    let mut h = harness(
        &config(false, 60),
        MqttTester::default(),
        api.clone(),
        vec![(1, Action::Shutdown)],
    );
    h.daemon.run();

    let published = h.mqtt.published();
    assert_eq!(published.len(), 3);
    assert_eq!(published[0], ("hypon/status".to_string(), "online".to_string(), true));
    assert_eq!(published[1].0, "hypon/42");
    let record: Value = serde_json::from_str(&published[1].1).unwrap();
    assert_eq!(
        record,
        json!({
            "percent": 5.39,
            "power_pv": 41,
            "today_generation": 0.02,
            "co2": 2.83,
            "gateway_online": 1,
        })
    );
    assert_eq!(published[2], ("hypon/status".to_string(), "offline".to_string(), true));
    assert_eq!(h.mqtt.broker.lock().unwrap().disconnects, 1);
    assert_eq!(h.daemon.state(), ConnectionState::ShuttingDown);
    assert_eq!(api.calls_to(LOGIN).len(), 1);
}

#[test]
fn expired_token_is_renewed_within_the_cycle() {
    let expired = r#"{"code":50008,"message":"token expired"}"#;
    let api = FakeApi::default()
        .with(LOGIN, r#"{"code":20000,"data":{"token":"t1"}}"#)
        .with(LOGIN, r#"{"code":20000,"data":{"token":"t2"}}"#)
        .with(MONITOR, expired)
        .with(MONITOR, r#"{"code":20000,"data":{"percent":77}}"#)
        .with(PRODUCTION, expired)
        .with(PRODUCTION, r#"{"code":20000,"data":{"co2":9.1}}"#)
        .with(STATUS, r#"{"code":20000,"data":{"gateway":{"online":0}}}"#)
        .with(STATUS, r#"{"code":20000,"data":{"gateway":{"online":1}}}"#);
    let mut h = harness(
        &config(false, 60),
        MqttTester::default(),
        api.clone(),
        vec![(1, Action::Shutdown)],
    );
    h.daemon.run();

    assert_eq!(api.calls_to(LOGIN).len(), 2);
    assert_eq!(api.calls_to(MONITOR), [Some("t1".to_string()), Some("t2".to_string())]);
    assert_eq!(api.calls_to(PRODUCTION), [Some("t1".to_string()), Some("t2".to_string())]);
    assert_eq!(api.calls_to(STATUS), [Some("t1".to_string()), Some("t2".to_string())]);

    let records = h.mqtt.published_to("hypon/42");
    assert_eq!(records.len(), 1);
    let record: Value = serde_json::from_str(&records[0]).unwrap();
    assert_eq!(record, json!({"percent": 77, "co2": 9.1, "gateway_online": 1}));
}

#[test]
fn reconnect_backoff_doubles() {
    let mqtt = MqttTester::refusing(3);
    let mut h = harness(
        &config(false, 60),
        mqtt,
        FakeApi::healthy(),
        vec![(36, Action::Shutdown)],
    );
    h.daemon.run();

    let broker = h.mqtt.broker.lock().unwrap();
    assert_eq!(broker.connect_attempts, 4);
    assert_eq!(broker.ticks_after_attempt[..3], [5u64, 10, 20]);
    drop(broker);

    assert_eq!(h.mqtt.published_to("hypon/42").len(), 1);
    assert_eq!(h.mqtt.published_to("hypon/status"), ["online", "offline"]);
}

#[test]
fn shutdown_during_initial_backoff_publishes_nothing() {
    let mut h = harness(
        &config(true, 60),
        MqttTester::unreachable(),
        FakeApi::healthy(),
        vec![(3, Action::Shutdown)],
    );
    h.daemon.run();

    assert_eq!(*h.ticks.lock().unwrap(), 3);
    let broker = h.mqtt.broker.lock().unwrap();
    assert_eq!(broker.connect_attempts, 1);
    assert!(broker.published.is_empty());
    assert_eq!(broker.disconnects, 0);
    drop(broker);
    assert_eq!(h.daemon.state(), ConnectionState::ShuttingDown);
}

#[test]
fn lost_connection_is_restored_before_next_poll() {
    let mut h = harness(
        &config(true, 2),
        MqttTester::default(),
        FakeApi::healthy(),
        vec![(2, Action::DropConnection), (3, Action::Shutdown)],
    );
    h.daemon.run();

    assert_eq!(h.mqtt.broker.lock().unwrap().connect_attempts, 2);
    assert_eq!(h.mqtt.published_to("hypon/42").len(), 2);
    assert_eq!(
        h.mqtt.published_to("hypon/status"),
        ["online", "online", "offline"]
    );
    // discovery is announced once, not on every reconnect
    assert_eq!(h.mqtt.discovery_count(), DISCOVERY_SENSORS);
}

#[test]
fn birth_message_triggers_new_discovery_pass() {
    let mut h = harness(
        &config(true, 60),
        MqttTester::default(),
        FakeApi::healthy(),
        vec![
            (1, Action::Deliver("homeassistant/status", "offline")),
            (2, Action::Deliver("homeassistant/other", "online")),
            (3, Action::Deliver("homeassistant/status", "online")),
            (4, Action::Shutdown),
        ],
    );
    h.daemon.run();

    assert!(h
        .mqtt
        .broker
        .lock()
        .unwrap()
        .subscriptions
        .contains(&"homeassistant/status".to_string()));
    assert_eq!(h.mqtt.discovery_count(), 2 * DISCOVERY_SENSORS);

    let published = h.mqtt.published();
    let (_, payload, retain) = published
        .iter()
        .find(|(t, _, _)| t == "homeassistant/sensor/hypon_42/power_pv/config")
        .unwrap();
    assert!(retain);
    let payload: Value = serde_json::from_str(payload).unwrap();
    assert_eq!(payload["state_topic"], "hypon/42");
    assert_eq!(payload["availability_topic"], "hypon/status");
}

#[test]
fn failed_cycles_are_skipped_not_fatal() {
    let api = FakeApi::default().with(LOGIN, r#"{"code":20000,"data":{"token":"t1"}}"#);
    let mut h = harness(
        &config(false, 1),
        MqttTester::default(),
        api.clone(),
        vec![(3, Action::Shutdown)],
    );
    h.daemon.run();

    // one cycle per tick until shutdown, none of them published
    assert_eq!(api.calls_to(MONITOR).len(), 3);
    assert!(h.mqtt.published_to("hypon/42").is_empty());
    assert_eq!(h.mqtt.published_to("hypon/status"), ["online", "offline"]);
}

#[test]
fn dry_run_fetches_without_touching_the_broker() {
    let config = Config::from_toml(
        r#"
        http_url = "http://api.test/v2"
        api_username = "user"
        api_password = "secret"
        system_ids = ["42"]
        http_interval = 2
        ha_discovery_enabled = true
        dry_run = true
        "#,
    )
    .unwrap();
    let api = FakeApi::healthy();
    let mut h = harness(
        &config,
        MqttTester::unreachable(),
        api.clone(),
        vec![(3, Action::Shutdown)],
    );
    h.daemon.run();

    // two fetch cycles ran, none reached the broker
    assert_eq!(api.calls_to(MONITOR).len(), 2);
    let broker = h.mqtt.broker.lock().unwrap();
    assert_eq!(broker.connect_attempts, 0);
    assert!(broker.published.is_empty());
    assert!(broker.subscriptions.is_empty());
    assert_eq!(broker.disconnects, 0);
    drop(broker);
    assert_eq!(h.daemon.state(), ConnectionState::ShuttingDown);
}
