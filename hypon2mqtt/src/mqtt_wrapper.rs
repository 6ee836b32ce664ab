use std::time::Duration;

use crate::mqtt_config::MqttConfig;

#[derive(Clone, Copy, Debug)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

/// Message the broker sends when the client disconnects ungracefully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

/// A message received on one of the subscribed topics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub trait MqttWrapper {
    // This trait provides an interface that the decouples library code from an
    // implementation of the MQTT client. On library calling code, one needs to
    // wrap the MQTT implementation, i.e. the client, in a new type that in
    // turn implements this trait.

    /// Opens a session with the broker, waiting at most `timeout` for it to
    /// be acknowledged. Replaces any previous session.
    fn connect(&mut self, timeout: Duration) -> anyhow::Result<()>;

    fn is_connected(&self) -> bool;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> anyhow::Result<()>;

    fn publish<S, V>(&mut self, topic: S, qos: QoS, retain: bool, payload: V) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>;

    /// Next message received on a subscribed topic, if any. Never blocks.
    fn try_recv(&mut self) -> Option<IncomingMessage>;

    /// Sends the disconnect after all queued publishes and waits at most
    /// `timeout` for the client to wind down.
    fn disconnect(&mut self, timeout: Duration) -> anyhow::Result<()>;

    fn new(config: &MqttConfig, last_will: Option<LastWill>) -> Self;
}
