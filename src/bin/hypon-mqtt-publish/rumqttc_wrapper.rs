use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;
use std::{fs, thread};

use anyhow::{anyhow, bail};
use hypon2mqtt::{
    mqtt_config::MqttConfig,
    mqtt_wrapper::{self, IncomingMessage, LastWill},
};
use log::{debug, warn};
use rumqttc::{
    tokio_rustls::rustls::{
        self,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
        ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    },
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Outgoing, Packet, Transport,
};

pub struct RumqttcWrapper {
    options: MqttOptions,
    setup_error: Option<String>,
    client: Option<Client>,
    connected: Arc<AtomicBool>,
    messages: Option<Receiver<IncomingMessage>>,
    finished: Option<Receiver<()>>,
}

fn match_qos(qos: mqtt_wrapper::QoS) -> rumqttc::QoS {
    match qos {
        mqtt_wrapper::QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        mqtt_wrapper::QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        mqtt_wrapper::QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

// Accepts every certificate and handshake signature the broker presents.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        Vec::from([
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ])
    }
}

fn tls_transport(config: &MqttConfig) -> anyhow::Result<Transport> {
    if config.tls_insecure {
        warn!("TLS certificate verification for the MQTT broker is disabled");
        let client_config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification))
            .with_no_client_auth();
        return Ok(Transport::tls_with_config(client_config.into()));
    }

    if let Some(ca_path) = &config.ca_path {
        let ca = fs::read(ca_path).map_err(|e| anyhow!("could not read CA file {ca_path}: {e}"))?;
        return Ok(Transport::tls(ca, None, None));
    }

    // Use rustls-native-certs to load root certificates from the operating system.
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for e in native.errors {
        warn!("could not load platform cert: {e}");
    }
    for cert in native.certs {
        if let Err(e) = roots.add(cert) {
            warn!("skipping invalid platform cert: {e}");
        }
    }

    let client_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Transport::tls_with_config(client_config.into()))
}

// Drives the connection until it fails or is closed. The first ConnAck or
// error is reported on `ready`.
fn drive(
    mut connection: Connection,
    connected: Arc<AtomicBool>,
    ready: Sender<anyhow::Result<()>>,
    messages: Sender<IncomingMessage>,
    finished: Sender<()>,
) {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::SeqCst);
                    let _ = ready.send(Ok(()));
                } else {
                    let _ = ready.send(Err(anyhow!("broker refused connection: {:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = messages.send(IncomingMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Packet::Disconnect)) | Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                break;
            }
            Ok(event) => debug!("mqtt event: {event:?}"),
            Err(e) => {
                warn!("mqtt connection error: {e}");
                let _ = ready.send(Err(anyhow!("{e}")));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = finished.send(());
}

impl RumqttcWrapper {
    fn client(&self) -> anyhow::Result<&Client> {
        self.client
            .as_ref()
            .ok_or_else(|| anyhow!("not connected to MQTT broker"))
    }
}

impl mqtt_wrapper::MqttWrapper for RumqttcWrapper {
    fn connect(&mut self, timeout: Duration) -> anyhow::Result<()> {
        if let Some(e) = &self.setup_error {
            bail!("{e}");
        }
        if let Some(client) = self.client.take() {
            let _ = client.disconnect();
        }
        // a fresh flag, so a winding down event loop cannot clear the new one
        self.connected = Arc::new(AtomicBool::new(false));

        let (client, connection) = Client::new(self.options.clone(), 512);
        let (ready_tx, ready_rx) = mpsc::channel();
        let (messages_tx, messages_rx) = mpsc::channel();
        let (finished_tx, finished_rx) = mpsc::channel();
        let connected = Arc::clone(&self.connected);
        thread::spawn(move || drive(connection, connected, ready_tx, messages_tx, finished_tx));

        self.client = Some(client);
        self.messages = Some(messages_rx);
        self.finished = Some(finished_rx);

        match ready_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                if let Some(client) = self.client.take() {
                    let _ = client.disconnect();
                }
                bail!("no answer from broker within {}s", timeout.as_secs())
            }
            Err(RecvTimeoutError::Disconnected) => bail!("mqtt event loop ended"),
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&mut self, topic: &str, qos: mqtt_wrapper::QoS) -> anyhow::Result<()> {
        Ok(self.client()?.subscribe(topic, match_qos(qos))?)
    }

    fn publish<S, V>(
        &mut self,
        topic: S,
        qos: mqtt_wrapper::QoS,
        retain: bool,
        payload: V,
    ) -> anyhow::Result<()>
    where
        S: Clone + Into<String>,
        V: Clone + Into<Vec<u8>>,
    {
        let client = self.client()?;
        // try publishing up to three times
        for _ in 0..2 {
            if client
                .try_publish(topic.clone(), match_qos(qos), retain, payload.clone())
                .is_ok()
            {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(100));
        }
        Ok(client.try_publish(topic, match_qos(qos), retain, payload)?)
    }

    fn try_recv(&mut self) -> Option<IncomingMessage> {
        self.messages.as_ref()?.try_recv().ok()
    }

    fn disconnect(&mut self, timeout: Duration) -> anyhow::Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        client.disconnect()?;
        // queued publishes go out before the disconnect packet
        if let Some(finished) = self.finished.take() {
            if finished.recv_timeout(timeout).is_err() {
                warn!("mqtt event loop did not finish within {}s", timeout.as_secs());
            }
        }
        Ok(())
    }

    fn new(config: &MqttConfig, last_will: Option<LastWill>) -> Self {
        let mut mqttoptions = MqttOptions::new(
            config
                .client_id
                .clone()
                .unwrap_or_else(|| "hypon-mqtt-publisher".to_string()),
            &config.host,
            config.port(),
        );
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        let mut setup_error = None;
        if config.use_tls() {
            match tls_transport(config) {
                Ok(transport) => {
                    mqttoptions.set_transport(transport);
                }
                Err(e) => setup_error = Some(format!("TLS setup failed: {e}")),
            }
        }

        //parse the mqtt authentication options
        if let Some((username, password)) = match (&config.username, &config.password) {
            (None, None) => None,
            (None, Some(_)) => None,
            (Some(username), None) => Some((username.clone(), "".into())),
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
        } {
            mqttoptions.set_credentials(username, password);
        }

        if let Some(will) = last_will {
            mqttoptions.set_last_will(rumqttc::LastWill::new(
                will.topic,
                will.payload,
                rumqttc::QoS::AtLeastOnce,
                will.retain,
            ));
        }

        Self {
            options: mqttoptions,
            setup_error,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            messages: None,
            finished: None,
        }
    }
}
