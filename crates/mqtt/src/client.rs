//! MQTT client construction with X.509 device identity.
//!
//! `ClientBuilder` assembles rumqttc's `AsyncClient` and `EventLoop` for one
//! connect attempt. `TlsIdentity` turns the device certificate, private key
//! and optional server CA into a rustls client configuration.
//!
//! # Examples
//!
//! ```ignore
//! let identity = TlsIdentity::new("device-cert.pem", "device-pkey.pem", None::<String>);
//! let (client, event_loop) = ClientBuilder::new("my-device", "broker.example.com", 8883, 10)
//!     .credentials("broker.example.com/my-device")
//!     .with_tls(identity)
//!     .build()?;
//! ```

use std::{fs, io::BufReader, path::PathBuf, sync::Arc, time::Duration};

use rumqttc::{AsyncClient, EventLoop, MqttOptions, TlsConfiguration, Transport};
use rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use super::error::TransferError;

/// Paths to the device's TLS material.
///
/// Files are read when [`TlsIdentity::client_config`] is called, not at
/// construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsIdentity {
    /// Device certificate (PEM).
    pub cert_path: PathBuf,

    /// Device private key (PEM, unencrypted).
    pub key_path: PathBuf,

    /// Server root CA (PEM). Falls back to the bundled webpki roots.
    pub ca_path: Option<PathBuf>,
}

impl TlsIdentity {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        ca_path: Option<impl Into<PathBuf>>,
    ) -> Self {
        Self {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            ca_path: ca_path.map(Into::into),
        }
    }

    fn open(path: &PathBuf) -> Result<BufReader<fs::File>, TransferError> {
        Ok(BufReader::new(fs::File::open(path)?))
    }

    fn root_store(&self) -> Result<RootCertStore, TransferError> {
        let mut roots = RootCertStore::empty();
        match &self.ca_path {
            Some(ca_path) => {
                let mut reader = Self::open(ca_path)?;
                for cert in rustls_pemfile::certs(&mut reader) {
                    roots.add(cert?).map_err(|e| {
                        TransferError::ClientSetup(format!(
                            "Invalid CA certificate {}: {e}",
                            ca_path.display()
                        ))
                    })?;
                }
                if roots.is_empty() {
                    return Err(TransferError::ClientSetup(format!(
                        "No CA certificates found in {}",
                        ca_path.display()
                    )));
                }
                debug!("Loaded {} CA certificate(s) from {}", roots.len(), ca_path.display());
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                debug!("Using bundled webpki root certificates");
            }
        }
        Ok(roots)
    }

    /// Builds a rustls client configuration authenticating with the device
    /// certificate.
    ///
    /// # Errors
    /// - `TransferError::Io`: a file is missing or unreadable
    /// - `TransferError::ClientSetup`: a file holds no usable PEM item, or
    ///   rustls rejects the certificate/key pair
    pub fn client_config(&self) -> Result<ClientConfig, TransferError> {
        let roots = self.root_store()?;

        let certs = rustls_pemfile::certs(&mut Self::open(&self.cert_path)?)
            .collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(TransferError::ClientSetup(format!(
                "No certificate found in {}",
                self.cert_path.display()
            )));
        }

        let key = rustls_pemfile::private_key(&mut Self::open(&self.key_path)?)?.ok_or_else(|| {
            TransferError::ClientSetup(format!(
                "No private key found in {}",
                self.key_path.display()
            ))
        })?;

        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransferError::ClientSetup(format!("Invalid device identity: {e}")))
    }
}

/// Builder for one rumqttc client/event loop pair.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls: Option<TlsIdentity>,
}

impl ClientBuilder {
    /// Starts a builder. An empty `client_id` is replaced by a random UUID.
    pub fn new(client_id: impl Into<String>, host: impl Into<String>, port: u16, cap: usize) -> Self {
        let mut client_id = client_id.into();
        if client_id.is_empty() {
            client_id = uuid::Uuid::new_v4().to_string();
        }
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(60));
        opts.set_clean_session(true);
        Self { opts, cap, tls: None }
    }

    /// Username with an empty password; the device is authenticated by its
    /// certificate.
    pub fn credentials(mut self, username: impl Into<String>) -> Self {
        self.opts.set_credentials(username, "");
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.opts.set_keep_alive(keep_alive);
        self
    }

    pub fn with_tls(mut self, identity: TlsIdentity) -> Self {
        self.tls = Some(identity);
        self
    }

    /// Builds the client and its event loop. Nothing touches the network
    /// until the event loop is polled.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(identity) = &self.tls {
            let config = identity.client_config()?;
            opts.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(config))));
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}
