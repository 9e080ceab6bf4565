//! End-to-end tests for the delivery pipeline
//!
//! These tests run a real tracker (durable queue in a temp dir, reqwest
//! transport) against a minimal HTTP responder on a local port.

use eventline_core::config::BackendPreference;
use eventline_core::context::{ContextSource, DeviceContext};
use eventline_core::flush::StopReason;
use eventline_core::identity::IdentityStore;
use eventline_core::{
    Config, DeliveryClient, DeliveryOutcome, Event, EventOrigin, FailureKind, Properties,
    QueueBackend, Tracker,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

// ============================================
// Test server
// ============================================

/// How the server answers one connection
#[derive(Clone)]
enum Reply {
    Status(u16, &'static str, Vec<(&'static str, &'static str)>),
    /// Accept the request and never answer
    Hang,
}

fn status(code: u16, reason: &'static str) -> Reply {
    Reply::Status(code, reason, Vec::new())
}

#[derive(Debug, Clone)]
struct Captured {
    request_line: String,
    headers: Vec<(String, String)>,
    body: Value,
}

impl Captured {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Captured>>>,
}

impl TestServer {
    /// Serve `replies` in order, then 200 for everything after
    async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let replies = Arc::new(Mutex::new(VecDeque::from(replies)));

        let captured = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let reply = replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| status(200, "OK"));
                tokio::spawn(handle(stream, reply, captured.clone()));
            }
        });

        Self { addr, requests }
    }

    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<Captured> {
        self.requests.lock().unwrap().clone()
    }
}

async fn handle(mut stream: TcpStream, reply: Reply, captured: Arc<Mutex<Vec<Captured>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let (head_end, content_length) = loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let length = head
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
                .and_then(|(_, v)| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            break (pos + 4, length);
        }
    };

    while buf.len() < head_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let head = String::from_utf8_lossy(&buf[..head_end - 4]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let body = serde_json::from_slice(&buf[head_end..head_end + content_length])
        .unwrap_or(Value::Null);

    captured.lock().unwrap().push(Captured {
        request_line,
        headers,
        body,
    });

    match reply {
        Reply::Status(code, reason, extra) => {
            let mut response = format!(
                "HTTP/1.1 {} {}\r\ncontent-length: 0\r\nconnection: close\r\n",
                code, reason
            );
            for (name, value) in extra {
                response.push_str(&format!("{}: {}\r\n", name, value));
            }
            response.push_str("\r\n");
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
    }
}

// ============================================
// Helpers
// ============================================

fn config(server: &TestServer, db_dir: &Path) -> Config {
    eventline_core::logging::init_test();
    let mut config = Config::default();
    config.tracker.base_url = Some(server.base_url());
    config.tracker.api_key = Some("test-key".to_string());
    config.tracker.environment = "test".to_string();
    config.queue.backend = BackendPreference::Durable;
    config.queue.path = Some(db_dir.join("eventline.db"));
    config.flush.inter_batch_delay_ms = 0;
    config
}

fn tracker(config: Config) -> Tracker {
    Tracker::builder(config).autostart(false).build().unwrap()
}

fn props(value: Value) -> Properties {
    value.as_object().cloned().unwrap()
}

// ============================================
// Delivery
// ============================================

#[tokio::test]
async fn test_batch_reaches_server() {
    let server = TestServer::start(vec![status(204, "No Content")]).await;
    let dir = TempDir::new().unwrap();
    let tracker = tracker(config(&server, dir.path()));
    assert_eq!(tracker.backend(), QueueBackend::Durable);

    tracker.identify("user-1");
    tracker.track("signup", props(json!({"plan": "pro"})));
    tracker.track("checkout", Properties::new());

    let report = tracker.flush().await;
    assert_eq!(report.delivered, 2);
    assert_eq!(report.stop_reason, Some(StopReason::Drained));
    assert_eq!(tracker.pending_count().await, 0);

    let requests = server.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert!(request.request_line.starts_with("POST /v1/events "));
    assert_eq!(request.header("x-api-key"), Some("test-key"));
    assert_eq!(request.header("content-type"), Some("application/json"));
    assert!(request
        .header("user-agent")
        .is_some_and(|ua| ua.starts_with("eventline/")));

    let events = request.body["events"].as_array().unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["name"], "signup");
    assert_eq!(events[0]["userId"], "user-1");
    assert_eq!(events[0]["properties"]["plan"], "pro");
    assert_eq!(events[0]["environment"], "test");
    assert!(events[0]["clientEventId"].is_string());
    assert_eq!(events[1]["name"], "checkout");
    assert_eq!(request.body["context"]["userId"], "user-1");
    assert_eq!(request.body["context"]["library"]["name"], "eventline");
}

#[tokio::test]
async fn test_server_error_keeps_events_across_restart() {
    let dir = TempDir::new().unwrap();
    {
        let server = TestServer::start(vec![status(503, "Service Unavailable")]).await;
        let tracker = tracker(config(&server, dir.path()));
        tracker.track("a", Properties::new());
        tracker.track("b", Properties::new());
        tracker.track("c", Properties::new());

        let report = tracker.flush().await;
        assert_eq!(
            report.stop_reason,
            Some(StopReason::Retryable(FailureKind::ServerError(503)))
        );
        assert_eq!(tracker.pending_count().await, 3);
    }

    // A new process finds the same events and delivers them
    let server = TestServer::start(Vec::new()).await;
    let tracker = tracker(config(&server, dir.path()));
    assert_eq!(tracker.pending_count().await, 3);

    let report = tracker.flush().await;
    assert_eq!(report.delivered, 3);
    assert_eq!(tracker.pending_count().await, 0);

    let names: Vec<_> = server.requests()[0].body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn test_rejected_batch_is_dropped() {
    let server = TestServer::start(vec![status(400, "Bad Request")]).await;
    let dir = TempDir::new().unwrap();
    let tracker = tracker(config(&server, dir.path()));

    tracker.track("a", Properties::new());
    tracker.track("b", Properties::new());
    let report = tracker.flush().await;

    assert_eq!(report.dropped, 2);
    assert_eq!(tracker.pending_count().await, 0);
    assert_eq!(tracker.stats().failures, 1);
}

#[tokio::test]
async fn test_rate_limit_blocks_further_requests() {
    let server = TestServer::start(vec![Reply::Status(
        429,
        "Too Many Requests",
        vec![("Retry-After", "120")],
    )])
    .await;
    let dir = TempDir::new().unwrap();
    let tracker = tracker(config(&server, dir.path()));

    tracker.track("a", Properties::new());
    let first = tracker.flush().await;
    assert_eq!(first.stop_reason, Some(StopReason::RateLimited));

    let second = tracker.flush().await;
    assert_eq!(second.stop_reason, Some(StopReason::RateLimited));
    assert_eq!(second.batches, 0);

    assert_eq!(server.requests().len(), 1);
    assert_eq!(tracker.pending_count().await, 1);
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let server = TestServer::start(vec![Reply::Hang]).await;
    let dir = TempDir::new().unwrap();
    let mut config = config(&server, dir.path());
    config.delivery.timeout_secs = 1;
    let client = DeliveryClient::new(&config.tracker, &config.delivery).unwrap();

    let origin = EventOrigin {
        user_id: None,
        session_id: "s".to_string(),
        platform: "test".to_string(),
        environment: "test".to_string(),
    };
    let events = vec![Event::new("a", Properties::new(), &origin)];
    let context = DeviceContext::new(Arc::new(IdentityStore::in_memory()), "s").current();

    let started = std::time::Instant::now();
    let outcome = client.deliver(&events, &context).await;
    assert_eq!(
        outcome,
        DeliveryOutcome::Retryable {
            kind: FailureKind::Timeout
        }
    );
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_threshold_triggers_flush() {
    let server = TestServer::start(Vec::new()).await;
    let dir = TempDir::new().unwrap();
    let mut config = config(&server, dir.path());
    config.flush.batch_size = 2;
    let tracker = tracker(config);

    tracker.track("a", Properties::new());
    tracker.track("b", Properties::new());

    // No explicit flush: reaching the batch size is enough
    for _ in 0..50 {
        if tracker.pending_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(tracker.pending_count().await, 0);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_shutdown_delivers_remaining() {
    let server = TestServer::start(Vec::new()).await;
    let dir = TempDir::new().unwrap();
    let mut config = config(&server, dir.path());
    config.flush.batch_size = 1;
    config.flush.flush_interval_secs = 3600;
    let tracker = Tracker::builder(config).build().unwrap();

    tracker.track("a", Properties::new());
    tracker.track("b", Properties::new());
    tracker.shutdown().await;

    // Threshold passes may still be finishing their last request
    for _ in 0..50 {
        if tracker.pending_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(tracker.pending_count().await, 0);
    let sent: usize = server
        .requests()
        .iter()
        .map(|r| r.body["events"].as_array().map_or(0, |e| e.len()))
        .sum();
    assert_eq!(sent, 2);
}
