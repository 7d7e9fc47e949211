//! Discovery and identity resolution.
//!
//! Resolving a device is two REST calls:
//!
//! 1. `GET {discovery}/api/v2.1/dsdk/cpId/{cpid}/env/{env}` returns the base
//!    URL (`bu`) of the identity service for the account.
//! 2. `GET {bu}/uid/{duid}` returns the broker host, MQTT client id and
//!    username, and the topic set of the device.
//!
//! Both responses share the `{d: {ec, ...}, status, message}` envelope. A
//! resolution either yields complete [`SessionParameters`] or fails with a
//! [`ConfigError`]; there are no retries.

use std::{error::Error as StdError, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::{debug, info};
use url::Url;

use crate::{
    config::{device::DeviceConfig, ConfigError},
    protocol::{
        discovery::DiscoveryResponse,
        identity::{IdentityData, IdentityResponse, SetTopics},
    },
};

/// Default limit for one HTTP request, body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Topic name used by the qualification endpoint for every route.
pub const QUALIFICATION_TOPIC: &str = "qualification";

/// Texts for the `ec` error codes of discovery and identity responses.
const EC_MESSAGES: [&str; 11] = [
    "OK – No Error",
    "Device not found. Device is not whitelisted to platform.",
    "Device is not active.",
    "Un-Associated. Device has not any template associated with it.",
    "Device is not acquired. Device is created but it is in release state.",
    "Device is disabled. It’s disabled from broker by Platform Admin",
    "Company not found as SID is not valid",
    "Subscription is expired.",
    "Connection Not Allowed.",
    "Invalid Bootstrap Certificate.",
    "Invalid Operational Certificate.",
];

/// Plain HTTP GET returning the response body.
///
/// Any transport failure, including a non-2xx status, is a
/// [`ConfigError::Discovery`].
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &Url) -> Result<String, ConfigError>;
}

/// [`HttpFetch`] over hyper with rustls and the bundled webpki roots.
pub struct HyperFetcher {
    client: Client<HttpsConnector<HttpConnector>, Empty<Bytes>>,
    timeout: Duration,
}

impl HyperFetcher {
    pub fn new(timeout: Duration) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        // Discovery URL overrides may point at a plain-HTTP test server.
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .build();

        Self {
            client: Client::builder(TokioExecutor::new()).build(https),
            timeout,
        }
    }

    async fn fetch(&self, uri: http::Uri) -> Result<String, ConfigError> {
        let response = self
            .client
            .get(uri)
            .await
            .map_err(|e| ConfigError::Discovery(format!("HTTP request failed: {}", error_chain(&e))))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConfigError::Discovery(format!(
                "HTTP Error {}: {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ConfigError::Discovery(format!("HTTP response read failed: {e}")))?
            .to_bytes();

        String::from_utf8(body.to_vec())
            .map_err(|e| ConfigError::Discovery(format!("HTTP response is not UTF-8: {e}")))
    }
}

impl Default for HyperFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[async_trait]
impl HttpFetch for HyperFetcher {
    async fn get(&self, url: &Url) -> Result<String, ConfigError> {
        let uri: http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: http::uri::InvalidUri| ConfigError::Discovery(format!("Invalid URL {url}: {e}")))?;

        tokio::time::timeout(self.timeout, self.fetch(uri))
            .await
            .map_err(|_| {
                ConfigError::Discovery(format!(
                    "HTTP request to {url} timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
    }
}

/// Joins an error with its sources. hyper's top-level messages alone are
/// not enough to tell DNS, TLS and connect failures apart.
fn error_chain(err: &dyn StdError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// MQTT topics assigned to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTopics {
    /// Telemetry reports.
    pub rpt: String,
    /// Cloud-to-device subscription.
    pub c2d: String,
    /// Faults.
    pub flt: Option<String>,
    /// Off-line data.
    pub od: Option<String>,
    /// Heartbeat.
    pub hb: Option<String>,
    /// Command and OTA acknowledgements.
    pub ack: Option<String>,
    /// Device logs.
    pub dl: Option<String>,
    /// Device identity requests.
    pub di: Option<String>,
    pub set: SetTopics,
}

/// Descriptive fields of the identity response.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityMetadata {
    /// Numeric platform code reported by the backend.
    pub platform_code: Option<i64>,
    pub is_edge_device: bool,
    pub is_gateway_device: bool,
    /// Message protocol version, e.g. "2.1".
    pub protocol_version: String,
    /// Telemetry interval suggested by the template, in seconds.
    pub data_frequency: Option<i64>,
}

/// Everything needed to open the device's MQTT session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionParameters {
    pub host: String,
    pub client_id: String,
    pub username: String,
    pub topics: SessionTopics,
    pub meta: IdentityMetadata,
}

impl SessionParameters {
    /// Points the session at a backend conformance endpoint. Replaces the
    /// host and routes reports, commands and acks through the
    /// `qualification` topic. Not for production use.
    pub fn with_qualification_endpoint(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self.topics.rpt = QUALIFICATION_TOPIC.to_owned();
        self.topics.c2d = QUALIFICATION_TOPIC.to_owned();
        self.topics.ack = Some(QUALIFICATION_TOPIC.to_owned());
        self
    }
}

/// Resolves a [`DeviceConfig`] into [`SessionParameters`].
pub struct DiscoveryResolver<F = HyperFetcher> {
    fetcher: F,
}

impl DiscoveryResolver<HyperFetcher> {
    pub fn new() -> Self {
        Self::with_fetcher(HyperFetcher::default())
    }
}

impl Default for DiscoveryResolver<HyperFetcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: HttpFetch> DiscoveryResolver<F> {
    pub fn with_fetcher(fetcher: F) -> Self {
        Self { fetcher }
    }

    /// Runs discovery then identity resolution.
    ///
    /// # Errors
    /// `ConfigError::Discovery` on any HTTP, parse or validation failure of
    /// either step.
    pub async fn resolve(&self, config: &DeviceConfig) -> Result<SessionParameters, ConfigError> {
        let url = discovery_api_url(config)?;
        info!("Requesting Discovery Data {}...", url);
        let body = self.fetcher.get(&url).await?;
        let base_url = parse_discovery_response(&body)?;

        let url = identity_api_url(&base_url, &config.duid)?;
        info!("Requesting Identity Data {}...", url);
        let body = self.fetcher.get(&url).await?;
        let params = parse_identity_response(&body)?;

        debug!(
            "Resolved broker {} for client {} (protocol {})",
            params.host, params.client_id, params.meta.protocol_version
        );
        Ok(params)
    }

    /// [`resolve`](Self::resolve) on a private current-thread runtime.
    ///
    /// Must not be called from inside an async runtime.
    pub fn resolve_blocking(&self, config: &DeviceConfig) -> Result<SessionParameters, ConfigError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.resolve(config))
    }
}

/// `{discovery}/api/v2.1/dsdk/cpId/{cpid}/env/{env}`
pub fn discovery_api_url(config: &DeviceConfig) -> Result<Url, ConfigError> {
    let base = config.discovery_url();
    append_segments(
        base,
        &["api", "v2.1", "dsdk", "cpId", &config.cpid, "env", &config.env],
    )
}

/// `{bu}/uid/{duid}`
pub fn identity_api_url(base_url: &str, duid: &str) -> Result<Url, ConfigError> {
    append_segments(base_url, &["uid", duid])
}

/// Appends `segments` to the path of `base`, escaping everything but
/// unreserved characters. `Url::path_segments_mut` leaves sub-delimiters
/// such as `+&=;` intact, which the identity service would misread.
fn append_segments(base: &str, segments: &[&str]) -> Result<Url, ConfigError> {
    let mut url =
        Url::parse(base).map_err(|e| ConfigError::Discovery(format!("Invalid URL {base}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::Discovery(format!("URL {base} cannot take a path")));
    }

    let mut path = url.path().trim_end_matches('/').to_string();
    for segment in segments {
        path.push('/');
        path.push_str(&escape_segment(segment));
    }
    url.set_path(&path);
    Ok(url)
}

/// Form encoding escapes all but `*-._` and alphanumerics, writing a space
/// as `+`. A literal `+` comes out as `%2B`, so any `+` left is a space.
fn escape_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Applies the common envelope rule: `status == 200`, `d` present and
/// `d.ec == 0`.
fn check_envelope(what: &str, ec: Option<i64>, status: i64, message: Option<&str>) -> Result<(), ConfigError> {
    let ec_message = match ec {
        Some(0) if status == 200 => return Ok(()),
        None | Some(0) => "not available".to_owned(),
        Some(ec) => match usize::try_from(ec).ok().and_then(|i| EC_MESSAGES.get(i)) {
            Some(text) => format!("ec={ec} ({text})"),
            None => format!("ec=={ec}"),
        },
    };
    let message = message
        .filter(|m| !m.is_empty())
        .unwrap_or("(message not available)");
    Err(ConfigError::Discovery(format!(
        "{what} failed. Error: \"{ec_message}\" status={status} message={message}"
    )))
}

/// Returns the identity base URL from a discovery response body.
pub fn parse_discovery_response(body: &str) -> Result<String, ConfigError> {
    let response: DiscoveryResponse = serde_json::from_str(body)
        .map_err(|e| ConfigError::Discovery(format!("Discovery JSON Parsing Error: {e}")))?;

    check_envelope(
        "Discovery",
        response.d.as_ref().map(|d| d.ec),
        response.status,
        response.message.as_deref(),
    )?;

    response
        .d
        .and_then(|d| d.bu)
        .filter(|bu| !bu.is_empty())
        .ok_or_else(|| ConfigError::Discovery("Discovery response is missing base URL".into()))
}

/// Maps an identity response body into [`SessionParameters`].
pub fn parse_identity_response(body: &str) -> Result<SessionParameters, ConfigError> {
    let response: IdentityResponse = serde_json::from_str(body)
        .map_err(|e| ConfigError::Discovery(format!("Identity JSON Parsing Error: {e}")))?;

    check_envelope(
        "Identity",
        response.d.as_ref().map(|d| d.ec),
        response.status,
        response.message.as_deref(),
    )?;

    match response.d {
        Some(d) => session_parameters(d),
        None => Err(ConfigError::Discovery("Identity response is missing data".into())),
    }
}

fn required(field: &str, value: Option<String>) -> Result<String, ConfigError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::Discovery(format!("Identity response is missing {field}")))
}

fn session_parameters(d: IdentityData) -> Result<SessionParameters, ConfigError> {
    let p = d.p;
    let topics = p.topics;
    Ok(SessionParameters {
        host: required("host (p.h)", p.h)?,
        client_id: required("client id (p.id)", p.id)?,
        username: p.un.unwrap_or_default(),
        topics: SessionTopics {
            rpt: required("report topic (p.topics.rpt)", topics.rpt)?,
            c2d: required("C2D topic (p.topics.c2d)", topics.c2d)?,
            flt: topics.flt,
            od: topics.od,
            hb: topics.hb,
            ack: topics.ack,
            dl: topics.dl,
            di: topics.di,
            set: topics.set,
        },
        meta: IdentityMetadata {
            platform_code: d.meta.pf,
            is_edge_device: d.meta.edge.unwrap_or(0) != 0,
            is_gateway_device: d.meta.gtw.unwrap_or(0) != 0,
            protocol_version: d.meta.v.to_string(),
            data_frequency: d.meta.df,
        },
    })
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::config::device::{tests::PemFiles, Platform};

    const AZ_DISCOVERY: &str = r#"{"d":{"ec":0,"bu":"https://diavnet.iotconnect.io/api/2.1/agent/device-identity/cg/b892c358-e375-4cc3-8841-32e271e26151","log:mqtt":{"hn":"","un":"","pwd":"","topic":""},"pf":"az"},"status":200,"message":"Success"}"#;

    const AZ_IDENTITY: &str = r#"{"d":{"ec":0,"ct":200,"meta":{"at":2,"df":60,"cd":"7LIBDEM","gtw":null,"edge":0,"pf":1,"hwv":"","swv":"","v":2.1},"has":{"d":0,"attr":1,"set":1,"r":0,"ota":0},"p":{"n":"mqtt","h":"poc-iotconnect-iothub-017-eu2.azure-devices.net","p":8883,"id":"avtds-nik-deleteme","un":"poc-iotconnect-iothub-017-eu2.azure-devices.net/avtds-nik-deleteme/?api-version=2018-06-30","topics":{"rpt":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=0&$.ct=application%2Fjson&$.ce=utf-8","flt":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=3&$.ct=application%2Fjson&$.ce=utf-8","od":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=4&$.ct=application%2Fjson&$.ce=utf-8","hb":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=5&$.ct=application%2Fjson&$.ce=utf-8","ack":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=6&$.ct=application%2Fjson&$.ce=utf-8","dl":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&mt=7&$.ct=application%2Fjson&$.ce=utf-8","di":"devices/avtds-nik-deleteme/messages/events/cd=7LIBDEM&v=2.1&di=1&$.ct=application%2Fjson&$.ce=utf-8","c2d":"devices/avtds-nik-deleteme/messages/devicebound/#","set":{"pub":"$iothub/twin/PATCH/properties/reported/?$rid={version}","sub":"$iothub/twin/PATCH/properties/desired/#","pubForAll":"$iothub/twin/GET/?$rid=0","subForAll":"$iothub/twin/res/#"}}},"dt":"2024-10-29T18:57:26.730Z"},"status":200,"message":"Device info loaded successfully."}"#;

    const AWS_DISCOVERY: &str = r#"{"d":{"ec":0,"bu":"https://awspocdi.iotconnect.io/api/2.1/agent/device-identity/cg/584af730-2854-4a77-8f3b-ca1696401e08","log:mqtt":{"hn":"","un":"","pwd":"","topic":""},"pf":"aws","dip":1,"errorMsg":null},"status":200,"message":"Success"}"#;

    const AWS_IDENTITY: &str = r#"{"d":{"ec":0,"ct":200,"meta":{"at":7,"df":5,"cd":"XG4EPK6","gtw":null,"edge":0,"pf":0,"hwv":"","swv":"","v":2.1},"has":{"d":0,"attr":1,"set":0,"r":0,"ota":0},"p":{"n":"mqtt","h":"a3etk4e19usyja-ats.iot.us-east-1.amazonaws.com","p":8883,"id":"avr-mchp-sn0123EE7A14329D3D01","un":"a3etk4e19usyja-ats.iot.us-east-1.amazonaws.com/avr-mchp-sn0123EE7A14329D3D01","topics":{"rpt":"$aws/rules/msg_d2c_rpt/avr-mchp-sn0123EE7A14329D3D01/2.1/0","flt":"$aws/rules/msg_d2c_flt/avr-mchp-sn0123EE7A14329D3D01/2.1/3","od":"$aws/rules/msg_d2c_od/avr-mchp-sn0123EE7A14329D3D01/2.1/4","hb":"$aws/rules/msg_d2c_hb/avr-mchp-sn0123EE7A14329D3D01/2.1/5","ack":"$aws/rules/msg_d2c_ack/avr-mchp-sn0123EE7A14329D3D01/2.1/6","dl":"$aws/rules/msg_d2c_dl/avr-mchp-sn0123EE7A14329D3D01/2.1/7","di":"$aws/rules/msg_d2c_di/avr-mchp-sn0123EE7A14329D3D01/2.1/1","c2d":"iot/avr-mchp-sn0123EE7A14329D3D01/cmd","set":{"pub":"$aws/things/avr-mchp-sn0123EE7A14329D3D01/shadow/name/setting_info/report","sub":"$aws/things/avr-mchp-sn0123EE7A14329D3D01/shadow/name/setting_info/property-shadow","pubForAll":"$aws/things/avr-mchp-sn0123EE7A14329D3D01/shadow/name/setting_info/get","subForAll":"$aws/things/avr-mchp-sn0123EE7A14329D3D01/shadow/name/setting_info/get/all"}}},"dt":"2024-10-29T19:22:03.421Z"},"status":200,"message":"Device info loaded successfully."}"#;

    /// Serves canned bodies by URL and records every request.
    struct FakeFetch {
        responses: HashMap<String, Result<String, String>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetch {
        fn new(responses: &[(&str, Result<&str, &str>)]) -> Self {
            Self {
                responses: responses
                    .iter()
                    .map(|(url, body)| (url.to_string(), body.map(str::to_owned).map_err(str::to_owned)))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpFetch for FakeFetch {
        async fn get(&self, url: &Url) -> Result<String, ConfigError> {
            self.requests.lock().unwrap().push(url.to_string());
            match self.responses.get(url.as_str()) {
                Some(Ok(body)) => Ok(body.clone()),
                Some(Err(e)) => Err(ConfigError::Discovery(e.clone())),
                None => Err(ConfigError::Discovery("HTTP Error 404: Not Found".into())),
            }
        }
    }

    fn device(files: &PemFiles, platform: Platform, env: &str) -> DeviceConfig {
        DeviceConfig::new(platform, env, "mycpid", "myduid", &files.cert, &files.key).unwrap()
    }

    #[test]
    fn test_discovery_url_per_platform() {
        let files = PemFiles::new();

        let az = device(&files, Platform::Az, "avnetpoc");
        assert_eq!(
            discovery_api_url(&az).unwrap().as_str(),
            "https://discovery.iotconnect.io/api/v2.1/dsdk/cpId/mycpid/env/avnetpoc"
        );

        let aws_poc = device(&files, Platform::Aws, "poc");
        assert_eq!(
            discovery_api_url(&aws_poc).unwrap().as_str(),
            "https://awsdiscovery.iotconnect.io/api/v2.1/dsdk/cpId/mycpid/env/poc"
        );

        let aws = device(&files, Platform::Aws, "prod");
        assert!(discovery_api_url(&aws)
            .unwrap()
            .as_str()
            .starts_with("https://consolediscovery.iotconnect.io/"));
    }

    #[test]
    fn test_url_segments_are_percent_encoded() {
        let files = PemFiles::new();
        let config = device(&files, Platform::Az, "my env/1")
            .with_discovery_url("https://discovery.example.com/");
        assert_eq!(
            discovery_api_url(&config).unwrap().as_str(),
            "https://discovery.example.com/api/v2.1/dsdk/cpId/mycpid/env/my%20env%2F1"
        );

        let url = identity_api_url("https://di.example.com/cg/abc", "dev?1").unwrap();
        assert_eq!(url.as_str(), "https://di.example.com/cg/abc/uid/dev%3F1");
    }

    #[test]
    fn test_url_segments_escape_sub_delimiters() {
        let url = identity_api_url("https://di.example.com/cg/abc/", "a+b&c=d;e f").unwrap();
        assert_eq!(url.as_str(), "https://di.example.com/cg/abc/uid/a%2Bb%26c%3Dd%3Be%20f");
        assert_eq!(url.path_segments().unwrap().last(), Some("a%2Bb%26c%3Dd%3Be%20f"));

        let files = PemFiles::new();
        let config = device(&files, Platform::Aws, "qa+1").with_discovery_url("https://discovery.example.com");
        assert!(discovery_api_url(&config).unwrap().as_str().ends_with("/env/qa%2B1"));
    }

    #[test]
    fn test_parse_identity_failure_with_null_blocks() {
        let err = parse_identity_response(
            r#"{"d":{"ec":1,"ct":null,"meta":null,"has":null,"p":null,"dt":null},"status":200,"message":"Device not found"}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Identity failed. Error: \"ec=1 (Device not found. Device is not whitelisted to platform.)\" status=200 message=Device not found"
        );
    }

    #[test]
    fn test_parse_identity_with_null_versions() {
        let body = AWS_IDENTITY.replace(r#""hwv":"","swv":"""#, r#""hwv":null,"swv":null"#);
        assert_ne!(body, AWS_IDENTITY);
        let params = parse_identity_response(&body).unwrap();
        assert_eq!(params.client_id, "avr-mchp-sn0123EE7A14329D3D01");
        assert_eq!(params.meta.protocol_version, "2.1");
    }

    #[test]
    fn test_parse_discovery_returns_base_url() {
        let bu = parse_discovery_response(AWS_DISCOVERY).unwrap();
        assert_eq!(
            bu,
            "https://awspocdi.iotconnect.io/api/2.1/agent/device-identity/cg/584af730-2854-4a77-8f3b-ca1696401e08"
        );
    }

    #[test]
    fn test_parse_discovery_failure_with_ec() {
        let err = parse_discovery_response(
            r#"{"d":{"ec":6,"bu":null,"log:mqtt":{"hn":"","un":"","pwd":"","topic":""},"pf":"aws","dip":0,"errorMsg":"CpId not found"},"status":200,"message":"CpId not found"}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Discovery failed. Error: \"ec=6 (Company not found as SID is not valid)\" status=200 message=CpId not found"
        );
    }

    #[test]
    fn test_parse_discovery_unmapped_ec_and_missing_message() {
        let err = parse_discovery_response(r#"{"d":{"ec":42},"status":200}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Discovery failed. Error: \"ec==42\" status=200 message=(message not available)"
        );
    }

    #[test]
    fn test_parse_discovery_bad_status_without_d() {
        let err = parse_discovery_response(r#"{"status":500,"message":"Internal"}"#).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Discovery failed. Error: \"not available\" status=500 message=Internal"
        );
    }

    #[test]
    fn test_parse_discovery_invalid_json() {
        let err = parse_discovery_response("<html>").unwrap_err();
        assert!(err.to_string().starts_with("Discovery JSON Parsing Error: "));
    }

    #[test]
    fn test_parse_discovery_missing_base_url() {
        let err = parse_discovery_response(r#"{"d":{"ec":0},"status":200,"message":"Success"}"#).unwrap_err();
        assert_eq!(err.to_string(), "Discovery response is missing base URL");
    }

    #[test]
    fn test_parse_identity_aws() {
        let params = parse_identity_response(AWS_IDENTITY).unwrap();
        assert_eq!(params.host, "a3etk4e19usyja-ats.iot.us-east-1.amazonaws.com");
        assert_eq!(params.client_id, "avr-mchp-sn0123EE7A14329D3D01");
        assert_eq!(
            params.username,
            "a3etk4e19usyja-ats.iot.us-east-1.amazonaws.com/avr-mchp-sn0123EE7A14329D3D01"
        );
        assert_eq!(params.topics.c2d, "iot/avr-mchp-sn0123EE7A14329D3D01/cmd");
        assert_eq!(
            params.topics.ack.as_deref(),
            Some("$aws/rules/msg_d2c_ack/avr-mchp-sn0123EE7A14329D3D01/2.1/6")
        );
        assert_eq!(params.meta.platform_code, Some(0));
        assert_eq!(params.meta.protocol_version, "2.1");
        assert_eq!(params.meta.data_frequency, Some(5));
        assert!(!params.meta.is_gateway_device);
    }

    #[test]
    fn test_parse_identity_failure_with_ec() {
        let err = parse_identity_response(
            r#"{"d":{"ec":1,"ct":200,"dt":"2024-10-29T20:10:44.382Z"},"status":200,"message":"Device info loaded successfully."}"#,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Identity failed. Error: \"ec=1 (Device not found. Device is not whitelisted to platform.)\" status=200 message=Device info loaded successfully."
        );
    }

    #[test]
    fn test_parse_identity_requires_c2d_topic() {
        let body = AWS_IDENTITY.replace(r#""c2d":"iot/avr-mchp-sn0123EE7A14329D3D01/cmd","#, "");
        let err = parse_identity_response(&body).unwrap_err();
        assert!(err.to_string().contains("C2D topic"));
    }

    #[test]
    fn test_parse_identity_invalid_json() {
        let err = parse_identity_response(r#"{"d":"#).unwrap_err();
        assert!(err.to_string().starts_with("Identity JSON Parsing Error: "));
    }

    #[test]
    fn test_qualification_endpoint_override() {
        let params = parse_identity_response(AZ_IDENTITY)
            .unwrap()
            .with_qualification_endpoint("qualification.example.com");
        assert_eq!(params.host, "qualification.example.com");
        assert_eq!(params.topics.rpt, QUALIFICATION_TOPIC);
        assert_eq!(params.topics.c2d, QUALIFICATION_TOPIC);
        assert_eq!(params.topics.ack.as_deref(), Some(QUALIFICATION_TOPIC));
        assert_eq!(params.client_id, "avtds-nik-deleteme");
    }

    #[tokio::test]
    async fn test_resolve_azure_device() {
        let files = PemFiles::new();
        let config = device(&files, Platform::Az, "avnetpoc");
        let fetch = FakeFetch::new(&[
            (
                "https://discovery.iotconnect.io/api/v2.1/dsdk/cpId/mycpid/env/avnetpoc",
                Ok(AZ_DISCOVERY),
            ),
            (
                "https://diavnet.iotconnect.io/api/2.1/agent/device-identity/cg/b892c358-e375-4cc3-8841-32e271e26151/uid/myduid",
                Ok(AZ_IDENTITY),
            ),
        ]);
        let resolver = DiscoveryResolver::with_fetcher(fetch);

        let params = resolver.resolve(&config).await.unwrap();
        assert_eq!(params.host, "poc-iotconnect-iothub-017-eu2.azure-devices.net");
        assert_eq!(params.topics.c2d, "devices/avtds-nik-deleteme/messages/devicebound/#");
        assert_eq!(
            params.topics.set.subscribe_for_all.as_deref(),
            Some("$iothub/twin/res/#")
        );
        assert_eq!(params.meta.platform_code, Some(1));
        assert_eq!(resolver.fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_resolve_stops_after_failed_discovery() {
        let files = PemFiles::new();
        let config = device(&files, Platform::Aws, "poc");
        let fetch = FakeFetch::new(&[(
            "https://awsdiscovery.iotconnect.io/api/v2.1/dsdk/cpId/mycpid/env/poc",
            Ok(r#"{"d":{"ec":7},"status":200,"message":"Subscription expired"}"#),
        )]);
        let resolver = DiscoveryResolver::with_fetcher(fetch);

        let err = resolver.resolve(&config).await.unwrap_err();
        assert!(err.to_string().contains("ec=7 (Subscription is expired.)"));
        assert_eq!(resolver.fetcher.requests().len(), 1);
    }

    #[test]
    fn test_resolve_blocking_wraps_http_failure() {
        let files = PemFiles::new();
        let config = device(&files, Platform::Az, "avnetpoc");
        let fetch = FakeFetch::new(&[(
            "https://discovery.iotconnect.io/api/v2.1/dsdk/cpId/mycpid/env/avnetpoc",
            Err("HTTP Error 503: Service Unavailable"),
        )]);
        let resolver = DiscoveryResolver::with_fetcher(fetch);

        let err = resolver.resolve_blocking(&config).unwrap_err();
        assert!(matches!(err, ConfigError::Discovery(_)));
        assert_eq!(err.to_string(), "HTTP Error 503: Service Unavailable");
    }

    #[test]
    fn test_error_chain_joins_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::Other, "dns failure");
        let outer = ConfigError::IoError(inner);
        assert!(error_chain(&outer).contains("dns failure"));
    }
}
