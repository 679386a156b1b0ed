//! HTTP edge workload backend.
//!
//! Signing keys live in the edge runtime; this client forwards SAS payloads
//! to its workload API and reads back the HMAC digest. The endpoint is
//! either TCP (`http://host:port`, through `reqwest`) or a Unix domain
//! socket (`unix:///path`, a `hyper` HTTP/1.1 connection on the stream).

use std::path::PathBuf;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::{CONTENT_TYPE, HOST};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use url::Url;

use devauth_core::EdgeConfig;

use crate::backend::EdgeHsm;
use crate::error::{HsmError, HsmResult};
use crate::sas;

pub const ENV_WORKLOAD_URI: &str = "IOTEDGE_WORKLOADURI";
pub const ENV_MODULE_GENERATION_ID: &str = "IOTEDGE_MODULEGENERATIONID";
pub const ENV_MODULE_ID: &str = "IOTEDGE_MODULEID";

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";
const SIGN_KEY_ID: &str = "primary";
const SIGN_ALGORITHM: &str = "HMACSHA256";
/// Upper bound on a buffered workload response body.
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkloadEndpoint {
    Tcp(Url),
    Unix(PathBuf),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest<'a> {
    key_id: &'a str,
    algo: &'a str,
    data: String,
}

#[derive(Deserialize)]
struct SignResponse {
    digest: Option<String>,
}

#[derive(Deserialize)]
struct TrustBundleResponse {
    certificate: Option<String>,
}

/// Client for the edge workload API.
pub struct EdgeClient {
    endpoint: WorkloadEndpoint,
    module_id: String,
    generation_id: String,
    api_version: String,
    timeout: Duration,
    http: reqwest::Client,
    runtime: tokio::runtime::Runtime,
}

impl EdgeClient {
    /// Read the workload coordinates from the process environment.
    pub fn from_env(config: &EdgeConfig) -> HsmResult<Self> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Read the workload coordinates through `lookup`.
    pub fn from_lookup<F>(config: &EdgeConfig, lookup: F) -> HsmResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |name: &str| {
            lookup(name).filter(|v| !v.is_empty()).ok_or_else(|| {
                error!("EdgeClient :: {} not set", name);
                HsmError::Config(format!("environment variable {} is not set", name))
            })
        };
        let workload_uri = required(ENV_WORKLOAD_URI)?;
        let generation_id = required(ENV_MODULE_GENERATION_ID)?;
        let module_id = required(ENV_MODULE_ID)?;
        Self::new(&workload_uri, &module_id, &generation_id, config)
    }

    pub fn new(
        workload_uri: &str,
        module_id: &str,
        generation_id: &str,
        config: &EdgeConfig,
    ) -> HsmResult<Self> {
        if module_id.is_empty() || generation_id.is_empty() {
            return Err(HsmError::InvalidArgument(
                "module id and generation id are required".into(),
            ));
        }
        let endpoint = parse_workload_uri(workload_uri)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        info!("STATUS: EdgeClient :: Workload {} :: CONFIGURED", workload_uri);
        Ok(Self {
            endpoint,
            module_id: module_id.to_owned(),
            generation_id: generation_id.to_owned(),
            api_version: config.api_version.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            http: reqwest::Client::new(),
            runtime,
        })
    }

    fn sign_path(&self) -> String {
        format!(
            "/modules/{}/genid/{}/sign?api-version={}",
            self.module_id, self.generation_id, self.api_version
        )
    }

    fn trust_bundle_path(&self) -> String {
        format!("/trust-bundle?api-version={}", self.api_version)
    }

    /// Issue one request and return the body of a 2xx response.
    fn call(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> HsmResult<Vec<u8>> {
        let exchange = async {
            match &self.endpoint {
                WorkloadEndpoint::Tcp(base) => {
                    tcp_request(&self.http, base, method.clone(), path, body).await
                }
                WorkloadEndpoint::Unix(socket) => {
                    unix_request(socket, method.clone(), path, body).await
                }
            }
        };
        let (status, response) = self
            .runtime
            .block_on(async { tokio::time::timeout(self.timeout, exchange).await })
            .map_err(|_| {
                error!("EdgeClient :: {} {} :: TIMED OUT", method, path);
                HsmError::Http(format!("request timed out after {:?}", self.timeout))
            })??;

        if status >= 300 {
            error!("EdgeClient :: {} {} :: HTTP {}", method, path, status);
            return Err(HsmError::Http(format!("workload returned HTTP {}", status)));
        }
        debug!("EdgeClient :: {} {} :: HTTP {}", method, path, status);
        Ok(response)
    }

    /// Request an HMAC of `data` from the workload API.
    pub fn sign_data(&self, data: &[u8]) -> HsmResult<Vec<u8>> {
        let body = signing_request_body(data)?;
        let response = self.call(Method::POST, &self.sign_path(), Some(body))?;
        let response: SignResponse = serde_json::from_slice(&response)?;
        let digest = response
            .digest
            .filter(|d| !d.is_empty())
            .ok_or_else(|| HsmError::Http("sign response has no digest".into()))?;
        STANDARD
            .decode(digest)
            .map_err(|e| HsmError::Http(format!("digest is not base64: {}", e)))
    }

    pub fn trust_bundle(&self) -> HsmResult<String> {
        let response = self.call(Method::GET, &self.trust_bundle_path(), None)?;
        let response: TrustBundleResponse = serde_json::from_slice(&response)?;
        response
            .certificate
            .filter(|c| !c.is_empty())
            .ok_or_else(|| HsmError::Http("trust bundle response has no certificate".into()))
    }
}

impl EdgeHsm for EdgeClient {
    fn sign_data(&mut self, data: &[u8]) -> HsmResult<Vec<u8>> {
        EdgeClient::sign_data(self, data)
    }

    fn trust_bundle(&mut self) -> HsmResult<String> {
        EdgeClient::trust_bundle(self)
    }
}

impl std::fmt::Debug for EdgeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeClient")
            .field("endpoint", &self.endpoint)
            .field("module_id", &self.module_id)
            .field("generation_id", &self.generation_id)
            .finish_non_exhaustive()
    }
}

fn parse_workload_uri(uri: &str) -> HsmResult<WorkloadEndpoint> {
    let parsed =
        Url::parse(uri).map_err(|e| HsmError::Config(format!("workload URI {}: {}", uri, e)))?;
    match parsed.scheme() {
        "http" => {
            if parsed.host_str().map_or(true, str::is_empty) {
                return Err(HsmError::Config(format!(
                    "workload URI {} must name a host",
                    uri
                )));
            }
            Ok(WorkloadEndpoint::Tcp(parsed))
        }
        "unix" => {
            if parsed.path().is_empty() || parsed.path() == "/" {
                return Err(HsmError::Config(format!(
                    "workload URI {} has no socket path",
                    uri
                )));
            }
            Ok(WorkloadEndpoint::Unix(PathBuf::from(parsed.path())))
        }
        other => Err(HsmError::Config(format!(
            "workload URI scheme {} is not supported",
            other
        ))),
    }
}

/// JSON body of a sign request for a `"<scope>\n<expiry>"` payload.
///
/// The scope is URL-encoded before the payload is base64 encoded; the
/// newline and expiry pass through unchanged.
pub(crate) fn signing_request_body(data: &[u8]) -> HsmResult<Vec<u8>> {
    let text = std::str::from_utf8(data)
        .map_err(|_| HsmError::InvalidArgument("data to sign is not UTF-8".into()))?;
    let (scope, expiry) = text.split_once('\n').ok_or_else(|| {
        HsmError::InvalidArgument("data to sign has no newline separator".into())
    })?;
    if expiry.is_empty() {
        return Err(HsmError::InvalidArgument("data to sign has no expiry".into()));
    }
    let payload = format!("{}\n{}", sas::url_encode(scope), expiry);
    let request = SignRequest {
        key_id: SIGN_KEY_ID,
        algo: SIGN_ALGORITHM,
        data: STANDARD.encode(payload),
    };
    Ok(serde_json::to_vec(&request)?)
}

async fn tcp_request(
    http: &reqwest::Client,
    base: &Url,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> HsmResult<(u16, Vec<u8>)> {
    let url = base
        .join(path)
        .map_err(|e| HsmError::Http(format!("request path {}: {}", path, e)))?;
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.header(CONTENT_TYPE, CONTENT_TYPE_JSON).body(body);
    }
    let mut response = request
        .send()
        .await
        .map_err(|e| HsmError::Http(format!("workload request failed: {}", e)))?;
    let status = response.status().as_u16();
    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| HsmError::Http(format!("workload response unreadable: {}", e)))?
    {
        append_capped(&mut bytes, &chunk)?;
    }
    Ok((status, bytes))
}

/// HTTP/1.1 over the workload socket, one connection per request.
#[cfg(unix)]
async fn unix_request(
    socket: &std::path::Path,
    method: Method,
    path: &str,
    body: Option<Vec<u8>>,
) -> HsmResult<(u16, Vec<u8>)> {
    use hyper::body::HttpBody;

    let stream = tokio::net::UnixStream::connect(socket).await?;
    let (mut sender, connection) = hyper::client::conn::handshake(stream)
        .await
        .map_err(|e| HsmError::Http(format!("workload handshake failed: {}", e)))?;

    let mut request = hyper::Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, "localhost");
    let body = match body {
        Some(body) => {
            request = request.header(CONTENT_TYPE, CONTENT_TYPE_JSON);
            hyper::Body::from(body)
        }
        None => hyper::Body::empty(),
    };
    let request = request
        .body(body)
        .map_err(|e| HsmError::Http(format!("request {}: {}", path, e)))?;

    let exchange = async move {
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| HsmError::Http(format!("workload request failed: {}", e)))?;
        let status = response.status().as_u16();
        let mut body = response.into_body();
        let mut bytes = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk
                .map_err(|e| HsmError::Http(format!("workload response unreadable: {}", e)))?;
            append_capped(&mut bytes, &chunk)?;
        }
        Ok((status, bytes))
    };
    tokio::pin!(exchange);
    tokio::pin!(connection);

    tokio::select! {
        biased;
        result = &mut exchange => result,
        closed = &mut connection => {
            closed.map_err(|e| HsmError::Http(format!("workload connection failed: {}", e)))?;
            // The connection ended cleanly; the response is already buffered.
            exchange.await
        }
    }
}

#[cfg(not(unix))]
async fn unix_request(
    socket: &std::path::Path,
    _method: Method,
    _path: &str,
    _body: Option<Vec<u8>>,
) -> HsmResult<(u16, Vec<u8>)> {
    Err(HsmError::Config(format!(
        "Unix socket {} unsupported on this platform",
        socket.display()
    )))
}

fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8]) -> HsmResult<()> {
    if buffer.len() + chunk.len() > MAX_RESPONSE_BYTES {
        error!("EdgeClient :: Response exceeds {} bytes :: REJECTED", MAX_RESPONSE_BYTES);
        return Err(HsmError::Http(format!(
            "workload response exceeds {} bytes",
            MAX_RESPONSE_BYTES
        )));
    }
    buffer.extend_from_slice(chunk);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> EdgeConfig {
        EdgeConfig {
            timeout_secs: 5,
            ..EdgeConfig::default()
        }
    }

    #[test]
    fn test_signing_body() {
        let body = signing_request_body(b"my hub/devices/d1\n1700000000").unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(json["keyId"], "primary");
        assert_eq!(json["algo"], "HMACSHA256");
        let data = STANDARD.decode(json["data"].as_str().unwrap()).unwrap();
        assert_eq!(data, b"my%20hub%2Fdevices%2Fd1\n1700000000");
    }

    #[test]
    fn test_signing_body_requires_expiry() {
        assert!(matches!(
            signing_request_body(b"scope-only"),
            Err(HsmError::InvalidArgument(_))
        ));
        assert!(matches!(
            signing_request_body(b"scope\n"),
            Err(HsmError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_workload_uri_schemes() {
        assert!(matches!(
            parse_workload_uri("http://127.0.0.1:15580").unwrap(),
            WorkloadEndpoint::Tcp(_)
        ));
        assert_eq!(
            parse_workload_uri("unix:///var/run/iotedge/workload.sock").unwrap(),
            WorkloadEndpoint::Unix(PathBuf::from("/var/run/iotedge/workload.sock"))
        );
        assert!(matches!(
            parse_workload_uri("https://127.0.0.1:443"),
            Err(HsmError::Config(_))
        ));
        assert!(matches!(parse_workload_uri("unix:///"), Err(HsmError::Config(_))));
    }

    #[test]
    fn test_environment_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_WORKLOAD_URI, "http://127.0.0.1:15580"),
            (ENV_MODULE_GENERATION_ID, "gen1"),
            (ENV_MODULE_ID, "module1"),
        ]
        .into_iter()
        .collect();
        let client =
            EdgeClient::from_lookup(&config(), |k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(
            client.sign_path(),
            "/modules/module1/genid/gen1/sign?api-version=2018-06-28"
        );

        let missing = EdgeClient::from_lookup(&config(), |k| {
            (k != ENV_MODULE_ID).then(|| "value".to_string())
        });
        assert!(matches!(missing, Err(HsmError::Config(_))));
    }

    #[test]
    fn test_response_size_is_capped() {
        let mut buffer = vec![0u8; MAX_RESPONSE_BYTES - 1];
        append_capped(&mut buffer, &[1]).unwrap();
        assert!(matches!(append_capped(&mut buffer, &[2]), Err(HsmError::Http(_))));
        assert_eq!(buffer.len(), MAX_RESPONSE_BYTES);
    }
}
