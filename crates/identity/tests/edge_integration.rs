//! Integration tests for the edge workload backend.
//!
//! A fake workload API runs on a `tokio` listener in its own thread; the
//! client under test drives it synchronously through [`HubAuth`].

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use devauth_core::EdgeConfig;
use devauth_identity::{
    BackendKind, CredentialRequest, CredentialResult, EdgeClient, HsmError, HsmFactory, HsmHandle,
    HsmResult, HsmSystem, HubAuth, HubAuthType, IotHubSecurityType,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Canned reply; `None` holds the connection open without answering.
type Reply = Option<(u16, String)>;

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
            let length = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse::<usize>().unwrap())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                break;
            }
        }
    }
    String::from_utf8(buf).unwrap()
}

/// Serve `replies` in order and report each request received.
fn spawn_workload(replies: Vec<Reply>) -> (String, mpsc::Receiver<String>) {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (request_tx, request_rx) = mpsc::channel();

    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            addr_tx.send(listener.local_addr().unwrap()).unwrap();

            for reply in replies {
                let (mut stream, _) = listener.accept().await.unwrap();
                let request = read_request(&mut stream).await;
                let _ = request_tx.send(request);
                match reply {
                    Some((status, body)) => {
                        let response = format!(
                            "HTTP/1.1 {} Workload\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status,
                            body.len(),
                            body
                        );
                        // Large bodies may be cut off by the client.
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                    }
                    None => tokio::time::sleep(Duration::from_secs(5)).await,
                }
            }
        });
    });

    let addr = addr_rx.recv().unwrap();
    (format!("http://{}", addr), request_rx)
}

/// Edge contexts pointed at a fixed workload URI.
struct FixedEdgeFactory {
    uri: String,
    timeout_secs: u64,
}

impl HsmFactory for FixedEdgeFactory {
    fn kind(&self) -> BackendKind {
        BackendKind::HttpEdge
    }

    fn create(&self) -> HsmResult<HsmHandle> {
        let config = EdgeConfig {
            timeout_secs: self.timeout_secs,
            ..EdgeConfig::default()
        };
        let client = EdgeClient::new(&self.uri, "module1", "gen1", &config)?;
        Ok(HsmHandle::HttpEdge(Box::new(client)))
    }
}

fn edge_auth(uri: String, timeout_secs: u64) -> (HsmSystem, HubAuth) {
    let system = HsmSystem::new(Box::new(FixedEdgeFactory { uri, timeout_secs }));
    let auth = HubAuth::create(&system, IotHubSecurityType::HttpEdge).unwrap();
    (system, auth)
}

#[test]
fn test_edge_signs_sas_token() {
    let digest = STANDARD.encode([0xFB, 0xFF, 0xFE]);
    let (uri, requests) = spawn_workload(vec![Some((200, format!("{{\"digest\":\"{}\"}}", digest)))]);
    let (_system, mut auth) = edge_auth(uri, 5);
    assert_eq!(auth.auth_type(), HubAuthType::Sas);

    let credentials = auth
        .generate_credentials(&CredentialRequest::sas("hub/devices/d1/modules/module1", 1_700_000_000))
        .unwrap();
    assert_eq!(
        credentials,
        CredentialResult::SasToken(
            "SharedAccessSignature sr=hub/devices/d1/modules/module1&sig=%2B%2F%2F%2B&se=1700000000&skn="
                .into()
        )
    );

    let request = requests.recv().unwrap();
    assert!(request.starts_with("POST /modules/module1/genid/gen1/sign?api-version=2018-06-28 HTTP/1.1"));
    assert!(request
        .to_lowercase()
        .contains("content-type: application/json; charset=utf-8"));
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["keyId"], "primary");
    assert_eq!(json["algo"], "HMACSHA256");
    assert_eq!(
        STANDARD.decode(json["data"].as_str().unwrap()).unwrap(),
        b"hub%2Fdevices%2Fd1%2Fmodules%2Fmodule1\n1700000000"
    );
}

#[test]
fn test_edge_trust_bundle() {
    let (uri, requests) = spawn_workload(vec![Some((
        200,
        "{\"certificate\":\"-----BEGIN CERTIFICATE-----\\nMIIB\\n-----END CERTIFICATE-----\\n\"}".into(),
    ))]);
    let (_system, mut auth) = edge_auth(uri, 5);

    let bundle = auth.trust_bundle().unwrap();
    assert!(bundle.starts_with("-----BEGIN CERTIFICATE-----\n"));
    assert!(requests
        .recv()
        .unwrap()
        .starts_with("GET /trust-bundle?api-version=2018-06-28 HTTP/1.1"));
}

#[test]
fn test_edge_error_status() {
    let (uri, _requests) = spawn_workload(vec![Some((500, "{}".into()))]);
    let (_system, mut auth) = edge_auth(uri, 5);

    assert!(matches!(
        auth.generate_credentials(&CredentialRequest::sas("scope", 1)),
        Err(HsmError::Http(_))
    ));
}

#[test]
fn test_edge_missing_digest() {
    let (uri, _requests) = spawn_workload(vec![Some((200, "{\"other\":1}".into()))]);
    let (_system, mut auth) = edge_auth(uri, 5);

    assert!(matches!(
        auth.generate_credentials(&CredentialRequest::sas("scope", 1)),
        Err(HsmError::Http(_))
    ));
}

#[test]
fn test_edge_request_times_out() {
    let (uri, _requests) = spawn_workload(vec![None]);
    let (_system, mut auth) = edge_auth(uri, 1);

    assert!(matches!(
        auth.generate_credentials(&CredentialRequest::sas("scope", 1)),
        Err(HsmError::Http(_))
    ));
}

#[test]
fn test_edge_oversized_response_rejected() {
    let body = format!("{{\"certificate\":\"{}\"}}", "A".repeat(2 * 1024 * 1024));
    let (uri, _requests) = spawn_workload(vec![Some((200, body))]);
    let (_system, mut auth) = edge_auth(uri, 5);

    assert!(matches!(auth.trust_bundle(), Err(HsmError::Http(_))));
}

/// Serve one chunked response on a Unix socket and report the request.
#[cfg(unix)]
fn spawn_unix_workload(
    socket: std::path::PathBuf,
    body: &'static str,
) -> mpsc::Receiver<String> {
    use tokio::net::UnixListener;

    let (ready_tx, ready_rx) = mpsc::channel();
    let (request_tx, request_rx) = mpsc::channel();
    thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = UnixListener::bind(&socket).unwrap();
            ready_tx.send(()).unwrap();

            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut request = Vec::new();
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .to_lowercase()
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .map(|v| v.parse::<usize>().unwrap())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let _ = request_tx.send(String::from_utf8(request).unwrap());

            let (head, tail) = body.split_at(body.len() / 2);
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n{:x}\r\n{}\r\n{:x}\r\n{}\r\n0\r\n\r\n",
                head.len(),
                head,
                tail.len(),
                tail
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });
    });
    ready_rx.recv().unwrap();
    request_rx
}

#[cfg(unix)]
#[test]
fn test_edge_signs_over_unix_socket() {
    let socket = std::env::temp_dir().join(format!("devauth-workload-{}.sock", std::process::id()));
    let _ = std::fs::remove_file(&socket);
    let requests = spawn_unix_workload(socket.clone(), "{\"digest\":\"AQID\"}");

    let (_system, mut auth) = edge_auth(format!("unix://{}", socket.display()), 5);
    let credentials = auth
        .generate_credentials(&CredentialRequest::sas("hub/devices/d1", 7))
        .unwrap();
    assert_eq!(
        credentials,
        CredentialResult::SasToken("SharedAccessSignature sr=hub/devices/d1&sig=AQID&se=7&skn=".into())
    );

    let request = requests.recv().unwrap();
    assert!(request.starts_with("POST /modules/module1/genid/gen1/sign?api-version=2018-06-28 HTTP/1.1"));
    assert!(request
        .to_lowercase()
        .contains("content-type: application/json; charset=utf-8"));
    let _ = std::fs::remove_file(&socket);
}

#[test]
fn test_edge_rejects_x509_credentials() {
    let (_system, mut auth) = edge_auth("http://127.0.0.1:9".into(), 1);

    assert!(matches!(
        auth.generate_credentials(&CredentialRequest::x509()),
        Err(HsmError::ProtocolSequence(_))
    ));
}
