use serde_derive::Deserialize;

pub const DEFAULT_PORT: u16 = 1883;
pub const DEFAULT_TLS_PORT: u16 = 8883;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    pub tls: Option<bool>,
    /// PEM file with the CA certificate(s) of the broker. Platform roots are
    /// used when absent.
    pub ca_path: Option<String>,
    /// Accept any broker certificate. Only for brokers with self-signed
    /// certificates on a trusted network.
    pub tls_insecure: bool,
}

impl MqttConfig {
    pub fn use_tls(&self) -> bool {
        self.tls.is_some_and(|tls| tls)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls() {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }
}
