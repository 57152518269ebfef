use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::{IpAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::core::error::MediaError;

struct FixedResolver {
    addrs: Vec<IpAddr>,
    lookups: AtomicUsize,
}

impl FixedResolver {
    fn new(addrs: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            addrs: addrs
                .iter()
                .map(|addr| addr.parse().expect("valid test address"))
                .collect(),
            lookups: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl HostResolver for FixedResolver {
    async fn lookup(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.addrs.clone())
    }
}

#[derive(Debug, Clone)]
struct MockResponse {
    status_code: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl MockResponse {
    fn new(status_code: u16, headers: &[(&str, &str)], body: &[u8]) -> Self {
        Self {
            status_code,
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            body: body.to_vec(),
        }
    }
}

struct MockServer {
    addr: std::net::SocketAddr,
    request_paths: Arc<Mutex<Vec<String>>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockServer {
    fn start(responses: Vec<MockResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let queue = Arc::new(Mutex::new(VecDeque::from(responses)));
        let request_paths = Arc::new(Mutex::new(Vec::new()));

        let queue_clone = Arc::clone(&queue);
        let paths_clone = Arc::clone(&request_paths);

        let handle = thread::spawn(move || {
            loop {
                let next_response = {
                    let mut queue = queue_clone.lock().expect("queue lock");
                    queue.pop_front()
                };

                let Some(response) = next_response else {
                    break;
                };

                let (mut stream, _) = listener.accept().expect("accept connection");
                stream
                    .set_read_timeout(Some(Duration::from_secs(3)))
                    .expect("set stream timeout");

                let request = read_request_head(&mut stream);
                let path = request
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or_default()
                    .to_string();
                paths_clone.lock().expect("paths lock").push(path);

                let _ = stream.write_all(&build_http_response(&response));
                let _ = stream.flush();
            }
        });

        Self {
            addr,
            request_paths,
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    fn request_paths(&self) -> Vec<String> {
        self.request_paths.lock().expect("paths lock").clone()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn read_request_head(stream: &mut std::net::TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(read) => {
                buffer.extend_from_slice(&chunk[..read]);
                if buffer.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buffer).to_string()
}

fn build_http_response(response: &MockResponse) -> Vec<u8> {
    let mut head = format!("HTTP/1.1 {} Mock\r\n", response.status_code);
    for (name, value) in &response.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    head.push_str("Connection: close\r\n\r\n");

    let mut bytes = head.into_bytes();
    bytes.extend_from_slice(&response.body);
    bytes
}

fn guarded_resolver() -> MediaResolver {
    MediaResolver::new(MediaPolicy::default()).expect("default policy is valid")
}

fn permissive_resolver(max_bytes: u64) -> MediaResolver {
    MediaResolver::new(MediaPolicy {
        max_bytes,
        timeout_ms: 2_000,
        max_redirects: 2,
        allow_private_networks: true,
    })
    .expect("test policy is valid")
}

async fn resolve_url(resolver: &MediaResolver, url: &str) -> Result<ResolvedMedia, MediaError> {
    resolver
        .resolve(
            &MediaReference::url(url),
            MediaKind::Image,
            &CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn test_rejects_literal_loopback_and_metadata_addresses() {
    let resolver = guarded_resolver();

    for url in [
        "http://127.0.0.1/x",
        "http://169.254.169.254/",
        "http://10.1.2.3/a.png",
        "http://[::1]/a.png",
        "http://[::ffff:192.168.0.10]/a.png",
        "http://[fd00::1]/a.png",
        "http://0.0.0.0/a.png",
    ] {
        let error = resolve_url(&resolver, url)
            .await
            .expect_err("non-public literal address must be rejected");
        assert!(
            matches!(error, MediaError::UnsafeTarget { .. }),
            "{url} produced {error:?}"
        );
    }
}

#[tokio::test]
async fn test_rejects_loopback_host_names_without_lookup() {
    let host_resolver = FixedResolver::new(&["93.184.216.34"]);
    let resolver = guarded_resolver().with_host_resolver(host_resolver.clone());

    for url in [
        "http://localhost/a.png",
        "http://LOCALHOST./a.png",
        "https://api.localhost/a.png",
    ] {
        let error = resolve_url(&resolver, url)
            .await
            .expect_err("loopback name must be rejected");
        assert!(matches!(error, MediaError::UnsafeTarget { .. }));
    }

    assert_eq!(host_resolver.lookups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rejects_hostname_resolving_to_private_address() {
    let host_resolver = FixedResolver::new(&["10.0.0.5"]);
    let resolver = guarded_resolver().with_host_resolver(host_resolver.clone());

    let error = resolve_url(&resolver, "https://images.internal.example/cat.png")
        .await
        .expect_err("private resolution must be rejected");

    assert_eq!(
        error,
        MediaError::UnsafeTarget {
            target: "https://images.internal.example/cat.png".to_string(),
            reason: "host images.internal.example resolves to non-public address 10.0.0.5"
                .to_string(),
        }
    );
    assert_eq!(host_resolver.lookups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_rejects_when_any_resolved_address_is_private() {
    let resolver = guarded_resolver()
        .with_host_resolver(FixedResolver::new(&["93.184.216.34", "fe80::1"]));

    let url = Url::parse("https://cdn.example/cat.png").expect("valid url");
    let error = resolver
        .check_target(&url)
        .await
        .expect_err("mixed resolution must be rejected");
    assert!(matches!(error, MediaError::UnsafeTarget { .. }));

    let public_only =
        guarded_resolver().with_host_resolver(FixedResolver::new(&["93.184.216.34"]));
    assert_eq!(public_only.check_target(&url).await, Ok(()));
}

#[tokio::test]
async fn test_rejects_unsupported_schemes() {
    let error = resolve_url(&guarded_resolver(), "ftp://example.com/cat.png")
        .await
        .expect_err("ftp must be rejected");

    assert!(matches!(error, MediaError::InvalidReference { .. }));
}

#[test]
fn test_blocked_ip_classification() {
    let blocked = [
        "127.0.0.1",
        "10.0.0.5",
        "172.16.4.1",
        "192.168.1.1",
        "169.254.169.254",
        "100.64.0.1",
        "0.0.0.0",
        "255.255.255.255",
        "::1",
        "::",
        "fc00::1",
        "fe80::abcd",
        "::ffff:127.0.0.1",
    ];
    for addr in blocked {
        let ip: IpAddr = addr.parse().expect("valid address");
        assert!(is_blocked_ip(ip), "{addr} should be blocked");
    }

    let allowed = ["93.184.216.34", "8.8.8.8", "172.32.0.1", "2606:4700::1111"];
    for addr in allowed {
        let ip: IpAddr = addr.parse().expect("valid address");
        assert!(!is_blocked_ip(ip), "{addr} should be allowed");
    }
}

#[tokio::test]
async fn test_inline_and_data_url_references_decode_without_network() {
    let resolver = guarded_resolver();
    let cancel = CancellationToken::new();

    let inline = resolver
        .resolve(
            &MediaReference::inline("image/png", &[0x89, 0x50, 0x4e, 0x47]),
            MediaKind::Image,
            &cancel,
        )
        .await
        .expect("inline media should decode");
    assert_eq!(inline.bytes, vec![0x89, 0x50, 0x4e, 0x47]);
    assert_eq!(inline.media_type, "image/png");

    let data_url = resolver
        .resolve(
            &MediaReference::url("data:audio/wav;base64,UklGRg=="),
            MediaKind::Audio,
            &cancel,
        )
        .await
        .expect("data url should decode");
    assert_eq!(data_url.bytes, b"RIFF".to_vec());
    assert_eq!(data_url.media_type, "audio/wav");

    let error = resolver
        .resolve(
            &MediaReference::url("data:text/plain,hello"),
            MediaKind::Any,
            &cancel,
        )
        .await
        .expect_err("non-base64 data url should be rejected");
    assert!(matches!(error, MediaError::InvalidReference { .. }));
}

#[tokio::test]
async fn test_inline_payload_respects_byte_ceiling() {
    let resolver = MediaResolver::new(MediaPolicy {
        max_bytes: 4,
        ..MediaPolicy::default()
    })
    .expect("valid policy");

    let error = resolver
        .resolve(
            &MediaReference::inline("image/png", &[0_u8; 16]),
            MediaKind::Image,
            &CancellationToken::new(),
        )
        .await
        .expect_err("oversized inline media should fail");

    assert_eq!(
        error,
        MediaError::PayloadTooLarge {
            target: "inline data".to_string(),
            limit_bytes: 4,
        }
    );
}

#[tokio::test]
async fn test_read_capped_stops_pulling_once_ceiling_is_exceeded() {
    let pulled = Arc::new(AtomicUsize::new(0));
    let pulled_clone = Arc::clone(&pulled);
    let endless = stream::repeat_with(move || {
        pulled_clone.fetch_add(1, Ordering::SeqCst);
        Ok::<_, std::io::Error>(vec![0_u8; 1024])
    });

    let error = read_capped(endless, 10 * 1024, "https://cdn.example/huge.png")
        .await
        .expect_err("endless body must be cut off");

    assert!(matches!(
        error,
        MediaError::PayloadTooLarge { limit_bytes, .. } if limit_bytes == 10 * 1024
    ));
    // Ten chunks fit; the eleventh crosses the ceiling and nothing more is read.
    assert_eq!(pulled.load(Ordering::SeqCst), 11);
}

#[tokio::test]
async fn test_read_capped_accepts_body_at_exact_ceiling() {
    let chunks = vec![
        Ok::<_, std::io::Error>(vec![1_u8; 3]),
        Ok(vec![2_u8; 2]),
    ];

    let bytes = read_capped(stream::iter(chunks), 5, "inline")
        .await
        .expect("body at ceiling should be accepted");
    assert_eq!(bytes, vec![1, 1, 1, 2, 2]);
}

#[tokio::test]
async fn test_fetch_returns_bytes_and_declared_media_type() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        &[("Content-Type", "image/png; charset=binary")],
        b"png-bytes",
    )]);

    let media = resolve_url(&permissive_resolver(1024), &server.url("/cat"))
        .await
        .expect("fetch should succeed");

    assert_eq!(media.bytes, b"png-bytes".to_vec());
    assert_eq!(media.media_type, "image/png");
}

#[tokio::test]
async fn test_fetch_rejects_wrong_media_family() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        &[("Content-Type", "text/html")],
        b"<html></html>",
    )]);

    let error = resolve_url(&permissive_resolver(1024), &server.url("/cat.png"))
        .await
        .expect_err("html must not pass as an image");

    assert!(matches!(
        error,
        MediaError::UnexpectedContentType { ref expected, ref actual, .. }
            if expected == "image/*" && actual.as_deref() == Some("text/html")
    ));
}

#[tokio::test]
async fn test_fetch_falls_back_to_extension_when_content_type_missing() {
    let server = MockServer::start(vec![
        MockResponse::new(200, &[], b"jpeg-bytes"),
        MockResponse::new(200, &[], b"mystery"),
    ]);
    let resolver = permissive_resolver(1024);

    let media = resolve_url(&resolver, &server.url("/photos/cat.JPG?v=2"))
        .await
        .expect("extension sniffing should succeed");
    assert_eq!(media.media_type, "image/jpeg");

    let error = resolve_url(&resolver, &server.url("/blob"))
        .await
        .expect_err("unknown extension without header must fail");
    assert!(matches!(
        error,
        MediaError::UnexpectedContentType { actual: None, .. }
    ));
}

#[tokio::test]
async fn test_fetch_rejects_declared_length_above_ceiling() {
    let server = MockServer::start(vec![MockResponse::new(
        200,
        &[("Content-Type", "image/png")],
        &[0_u8; 64],
    )]);

    let error = resolve_url(&permissive_resolver(16), &server.url("/big.png"))
        .await
        .expect_err("oversized body must be rejected");

    assert!(matches!(
        error,
        MediaError::PayloadTooLarge { limit_bytes: 16, .. }
    ));
}

#[tokio::test]
async fn test_fetch_follows_redirects_through_the_guard() {
    let server = MockServer::start(vec![
        MockResponse::new(302, &[("Location", "/final.png")], b""),
        MockResponse::new(200, &[("Content-Type", "image/png")], b"ok"),
    ]);

    let media = resolve_url(&permissive_resolver(1024), &server.url("/start"))
        .await
        .expect("redirect should be followed");

    assert_eq!(media.bytes, b"ok".to_vec());
    assert_eq!(server.request_paths(), vec!["/start", "/final.png"]);
}

#[tokio::test]
async fn test_fetch_surfaces_http_status_as_transport_error() {
    let server = MockServer::start(vec![MockResponse::new(404, &[], b"missing")]);

    let error = resolve_url(&permissive_resolver(1024), &server.url("/gone.png"))
        .await
        .expect_err("404 must fail");

    assert!(matches!(
        error,
        MediaError::Transport {
            status_code: Some(404),
            ..
        }
    ));
}

/// Answers with a public address first and loopback on every later lookup.
struct RebindingResolver {
    lookups: AtomicUsize,
}

#[async_trait]
impl HostResolver for RebindingResolver {
    async fn lookup(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        let answer = if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
            "192.0.2.10"
        } else {
            "127.0.0.1"
        };
        Ok(vec![answer.parse().expect("valid test address")])
    }
}

struct HangingResolver;

#[async_trait]
impl HostResolver for HangingResolver {
    async fn lookup(&self, _host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_fetch_connects_only_to_vetted_addresses() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    listener
        .set_nonblocking(true)
        .expect("nonblocking listener");
    let port = listener.local_addr().expect("listener addr").port();

    let host_resolver = Arc::new(RebindingResolver {
        lookups: AtomicUsize::new(0),
    });
    let resolver = MediaResolver::new(MediaPolicy {
        timeout_ms: 300,
        ..MediaPolicy::default()
    })
    .expect("test policy is valid")
    .with_host_resolver(host_resolver.clone());

    let error = resolve_url(&resolver, &format!("http://rebind.test:{port}/x.png"))
        .await
        .expect_err("vetted public address is unreachable in tests");

    assert!(matches!(error, MediaError::Transport { .. }), "{error:?}");
    assert_eq!(host_resolver.lookups.load(Ordering::SeqCst), 1);
    assert!(
        matches!(
            listener.accept(),
            Err(ref accept_error) if accept_error.kind() == std::io::ErrorKind::WouldBlock
        ),
        "no connection may reach the loopback listener"
    );
}

#[tokio::test(start_paused = true)]
async fn test_host_lookup_is_bounded_by_policy_timeout() {
    let resolver = MediaResolver::new(MediaPolicy {
        timeout_ms: 500,
        ..MediaPolicy::default()
    })
    .expect("test policy is valid")
    .with_host_resolver(Arc::new(HangingResolver));

    let error = resolve_url(&resolver, "https://slow-dns.example/cat.png")
        .await
        .expect_err("hanging lookup must time out");

    match error {
        MediaError::Transport {
            status_code: None,
            message,
            ..
        } => assert!(message.contains("timed out"), "{message}"),
        other => panic!("expected transport error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_canceled_token_aborts_remote_fetch() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let error = permissive_resolver(1024)
        .resolve(
            &MediaReference::url("http://198.51.100.7/never.png"),
            MediaKind::Image,
            &cancel,
        )
        .await
        .expect_err("canceled fetch must fail");

    assert!(matches!(error, MediaError::Canceled { .. }));
}

#[test]
fn test_media_policy_validation() {
    assert!(MediaPolicy::default().validate().is_ok());
    assert!(
        MediaPolicy {
            max_bytes: 0,
            ..MediaPolicy::default()
        }
        .validate()
        .is_err()
    );
}
