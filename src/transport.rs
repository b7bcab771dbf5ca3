//! # Broker Transport
//!
//! ## Why This Module Exists
//! The connection lifecycle is written against a narrow [`Transport`] trait
//! instead of the rumqttc types directly. The production implementation
//! ([`RumqttcTransport`]) wires up TLS, the last-will registration and the
//! event loop; tests substitute a scripted mock so the lifecycle state
//! machine can be exercised without a broker.
//!
//! ## Verification Modes
//! Two server-verification paths exist, selected by the credential
//! validator:
//! - **Trust anchor**: the supplied CA PEM goes straight into rumqttc's
//!   `TlsConfiguration::Simple` together with optional client material.
//! - **Fingerprint**: a custom rustls verifier pins the server's end-entity
//!   certificate by SHA-256 digest. Signature checks still run through the
//!   default crypto provider; only chain building is replaced.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::crypto::{verify_tls12_signature, verify_tls13_signature};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS, TlsConfiguration,
};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::credentials::{CredentialSet, VerifyMode};
use crate::error::AgentError;

/// Quality-of-service level, mirrored so the trait does not leak rumqttc
/// types into the rest of the crate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl From<QosLevel> for QoS {
    fn from(level: QosLevel) -> Self {
        match level {
            QosLevel::AtMostOnce => QoS::AtMostOnce,
            QosLevel::AtLeastOnce => QoS::AtLeastOnce,
            QosLevel::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Last-will registration carried by the broker connect.
#[derive(Clone, Debug)]
pub struct LastWillConfig {
    pub topic: String,
    pub payload: String,
    pub qos: QosLevel,
    pub retain: bool,
}

/// Everything a single broker connect needs.
#[derive(Clone, Debug)]
pub struct SessionSetup {
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub last_will: LastWillConfig,
}

/// One inbound broker message, payload decoded lossily to UTF-8.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// Outcome of one pump iteration of the transport.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    /// Session (re-)established at the protocol level
    Connected,
    /// An application message arrived
    Inbound(InboundMessage),
    /// The session dropped; reason is the transport's last error
    Disconnected(String),
    /// Protocol housekeeping only (acks, pings)
    Idle,
}

/// Seam between the connection lifecycle and the wire-protocol engine.
#[async_trait]
pub trait Transport {
    /// Validates and installs secure-transport material before any connect.
    fn configure_tls(
        &mut self,
        credentials: &CredentialSet,
        mode: VerifyMode,
    ) -> Result<(), AgentError>;

    /// One connect attempt, including last-will registration. Blocks until
    /// the broker acknowledges the session or the attempt fails.
    async fn connect(&mut self, setup: &SessionSetup) -> Result<(), AgentError>;

    async fn subscribe(&mut self, topic: &str, qos: QosLevel) -> Result<(), AgentError>;

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), AgentError>;

    /// Drives one iteration of inbound/outbound protocol I/O.
    async fn poll(&mut self) -> TransportEvent;

    fn is_connected(&self) -> bool;
}

/// Pins the server's end-entity certificate by SHA-256 digest instead of
/// building a chain to a trust anchor. Signature verification is unchanged.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: Vec<u8>,
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate fingerprint mismatch".into(),
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Decodes a fingerprint given as hex, with or without `:` separators, into
/// a 32-byte SHA-256 digest.
fn parse_fingerprint(raw: &str) -> Result<Vec<u8>, AgentError> {
    let compact: String = raw.chars().filter(|c| *c != ':' && !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact)
        .map_err(|_| AgentError::CredentialInvalid("fingerprint is not valid hex".into()))?;
    if bytes.len() != 32 {
        return Err(AgentError::CredentialInvalid(format!(
            "fingerprint must be a SHA-256 digest (32 bytes), got {}",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn parse_client_auth(
    credentials: &CredentialSet,
) -> Result<
    Option<(
        Vec<CertificateDer<'static>>,
        rustls::pki_types::PrivateKeyDer<'static>,
    )>,
    AgentError,
> {
    if !credentials.uses_mutual_auth() {
        return Ok(None);
    }
    let cert_pem = credentials.client_cert.as_deref().unwrap_or_default();
    let key_pem = credentials.client_key.as_deref().unwrap_or_default();

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .collect::<Result<_, _>>()
            .map_err(|e| AgentError::CredentialInvalid(format!("client certificate: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| AgentError::CredentialInvalid(format!("client key: {e}")))?
        .ok_or_else(|| AgentError::CredentialInvalid("client key PEM holds no key".into()))?;
    if certs.is_empty() {
        return Err(AgentError::CredentialInvalid(
            "client certificate PEM holds no certificate".into(),
        ));
    }
    Ok(Some((certs, key)))
}

/// Production transport: rumqttc async client over rustls.
pub struct RumqttcTransport {
    tls: Option<TlsConfiguration>,
    session: Option<(AsyncClient, EventLoop)>,
    connected: bool,
    connect_timeout: Duration,
}

impl Default for RumqttcTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttcTransport {
    pub fn new() -> Self {
        Self {
            tls: None,
            session: None,
            connected: false,
            connect_timeout: Duration::from_secs(10),
        }
    }

    fn client(&self) -> Result<&AsyncClient, AgentError> {
        self.session
            .as_ref()
            .map(|(client, _)| client)
            .ok_or_else(|| AgentError::PublishFailed("no broker session".into()))
    }
}

#[async_trait]
impl Transport for RumqttcTransport {
    fn configure_tls(
        &mut self,
        credentials: &CredentialSet,
        mode: VerifyMode,
    ) -> Result<(), AgentError> {
        let tls = match mode {
            VerifyMode::TrustAnchor => {
                let ca = credentials
                    .trust_anchor
                    .as_deref()
                    .unwrap_or_default()
                    .as_bytes()
                    .to_vec();
                let client_auth = match (&credentials.client_cert, &credentials.client_key) {
                    (Some(cert), Some(key)) => {
                        Some((cert.as_bytes().to_vec(), key.as_bytes().to_vec()))
                    }
                    _ => None,
                };
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth,
                }
            }
            VerifyMode::Fingerprint => {
                let expected = parse_fingerprint(
                    credentials.server_fingerprint.as_deref().unwrap_or_default(),
                )?;
                let provider = Arc::new(rustls::crypto::ring::default_provider());
                let verifier = Arc::new(FingerprintVerifier { expected, provider });
                let builder = rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(verifier);
                let config = match parse_client_auth(credentials)? {
                    Some((certs, key)) => builder
                        .with_client_auth_cert(certs, key)
                        .map_err(|e| AgentError::CredentialInvalid(e.to_string()))?,
                    None => builder.with_no_client_auth(),
                };
                TlsConfiguration::Rustls(Arc::new(config))
            }
        };
        self.tls = Some(tls);
        Ok(())
    }

    async fn connect(&mut self, setup: &SessionSetup) -> Result<(), AgentError> {
        let mut options =
            MqttOptions::new(setup.client_id.clone(), setup.host.clone(), setup.port);
        options
            .set_keep_alive(setup.keep_alive)
            .set_credentials(setup.username.clone(), setup.password.clone())
            .set_last_will(LastWill::new(
                setup.last_will.topic.clone(),
                setup.last_will.payload.clone().into_bytes(),
                setup.last_will.qos.into(),
                setup.last_will.retain,
            ))
            .set_max_packet_size(2048, 2048);
        if let Some(tls) = &self.tls {
            options.set_transport(rumqttc::Transport::Tls(tls.clone()));
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);

        // Drive the loop until the broker acknowledges the session; any
        // error before that counts as a failed attempt.
        let wait = tokio::time::timeout(self.connect_timeout, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                    Ok(other) => debug!("pre-session event: {:?}", other),
                    Err(e) => return Err(AgentError::TransportConnectFailed(e.to_string())),
                }
            }
        })
        .await
        .map_err(|_| AgentError::TransportConnectFailed("connect timed out".into()))?;
        wait?;

        self.session = Some((client, event_loop));
        self.connected = true;
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QosLevel) -> Result<(), AgentError> {
        self.client()?
            .subscribe(topic, qos.into())
            .await
            .map_err(|e| AgentError::TransportConnectFailed(format!("subscribe {topic}: {e}")))
    }

    async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QosLevel,
        retain: bool,
    ) -> Result<(), AgentError> {
        self.client()?
            .publish(topic, qos.into(), retain, payload)
            .await
            .map_err(|e| AgentError::PublishFailed(e.to_string()))
    }

    async fn poll(&mut self) -> TransportEvent {
        let Some((_, event_loop)) = self.session.as_mut() else {
            return TransportEvent::Disconnected("no broker session".into());
        };
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                self.connected = true;
                TransportEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                TransportEvent::Inbound(InboundMessage {
                    topic: publish.topic.clone(),
                    payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                })
            }
            Ok(_) => TransportEvent::Idle,
            Err(e) => {
                warn!("transport error: {e}");
                self.connected = false;
                TransportEvent::Disconnected(e.to_string())
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted transport for lifecycle tests.

    use super::*;
    use std::collections::VecDeque;

    #[derive(Clone, Debug, PartialEq)]
    pub(crate) struct PublishRecord {
        pub topic: String,
        pub payload: String,
        pub qos: QosLevel,
        pub retain: bool,
    }

    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub connected: bool,
        /// Connect attempts that fail before one succeeds
        pub fail_connects: u32,
        pub connect_attempts: u32,
        pub configured_mode: Option<VerifyMode>,
        pub last_will: Option<LastWillConfig>,
        pub subscriptions: Vec<(String, QosLevel)>,
        pub published: Vec<PublishRecord>,
        pub inbound: VecDeque<InboundMessage>,
        /// When set, the next poll reports a dropped session
        pub drop_session: bool,
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn configure_tls(
            &mut self,
            credentials: &CredentialSet,
            mode: VerifyMode,
        ) -> Result<(), AgentError> {
            let _ = credentials;
            self.configured_mode = Some(mode);
            Ok(())
        }

        async fn connect(&mut self, setup: &SessionSetup) -> Result<(), AgentError> {
            self.connect_attempts += 1;
            self.last_will = Some(setup.last_will.clone());
            if self.fail_connects > 0 {
                self.fail_connects -= 1;
                return Err(AgentError::TransportConnectFailed("refused".into()));
            }
            self.connected = true;
            Ok(())
        }

        async fn subscribe(&mut self, topic: &str, qos: QosLevel) -> Result<(), AgentError> {
            self.subscriptions.push((topic.to_string(), qos));
            Ok(())
        }

        async fn publish(
            &mut self,
            topic: &str,
            payload: &[u8],
            qos: QosLevel,
            retain: bool,
        ) -> Result<(), AgentError> {
            if !self.connected {
                return Err(AgentError::PublishFailed("not connected".into()));
            }
            self.published.push(PublishRecord {
                topic: topic.to_string(),
                payload: String::from_utf8_lossy(payload).into_owned(),
                qos,
                retain,
            });
            Ok(())
        }

        async fn poll(&mut self) -> TransportEvent {
            if self.drop_session {
                self.drop_session = false;
                self.connected = false;
                return TransportEvent::Disconnected("scripted drop".into());
            }
            match self.inbound.pop_front() {
                Some(message) => TransportEvent::Inbound(message),
                None => TransportEvent::Idle,
            }
        }

        fn is_connected(&self) -> bool {
            self.connected
        }
    }
}
