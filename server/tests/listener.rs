//! Listener tests against a fake tunnel backend: port probing, bind-before-tunnel ordering,
//! URL composition, credential guard, teardown.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use hooktunnel::tunnels::{Tunnel, TunnelBackend, TunnelError, TunnelGuard, TunnelRequest};
use hooktunnel::{
    CallbackEvent, CallbackListener, HandlerConfig, Level, ListenerError, ListenerOptions, LogEvent,
    TunnelStatusEvent, CALLBACK_RESPONSE,
};

const FAKE_URL: &str = "https://abc123.example.dev";

/// Fake provider. Records every request, checks the local port already accepts connections,
/// and counts how many tunnels were closed.
struct FakeBackend {
    url: String,
    fail: Option<String>,
    close_error: Option<String>,
    calls: Mutex<Vec<TunnelRequest>>,
    reachable_at_connect: Mutex<Vec<bool>>,
    closed: Arc<AtomicUsize>,
}

impl FakeBackend {
    fn ok(url: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            fail: None,
            close_error: None,
            calls: Mutex::default(),
            reachable_at_connect: Mutex::default(),
            closed: Arc::default(),
        })
    }

    fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            url: String::new(),
            fail: Some(reason.to_string()),
            close_error: None,
            calls: Mutex::default(),
            reachable_at_connect: Mutex::default(),
            closed: Arc::default(),
        })
    }

    /// Connects fine, but closing the tunnel reports `reason`.
    fn close_fails(url: &str, reason: &str) -> Arc<Self> {
        Arc::new(Self {
            url: url.to_string(),
            fail: None,
            close_error: Some(reason.to_string()),
            calls: Mutex::default(),
            reachable_at_connect: Mutex::default(),
            closed: Arc::default(),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TunnelBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn connect(&self, request: &TunnelRequest) -> Result<Tunnel, TunnelError> {
        self.calls.lock().unwrap().push(request.clone());
        let reachable = tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, request.local_port))
            .await
            .is_ok();
        self.reachable_at_connect.lock().unwrap().push(reachable);
        if let Some(reason) = &self.fail {
            return Err(TunnelError::Connect(reason.clone()));
        }
        let closed = Arc::clone(&self.closed);
        let close_error = self.close_error.clone();
        let guard = TunnelGuard::spawn(move |rx| async move {
            let _ = rx.await;
            closed.fetch_add(1, Ordering::SeqCst);
            match close_error {
                Some(reason) => Err(TunnelError::Close(reason)),
                None => Ok(()),
            }
        });
        Ok(Tunnel {
            url: self.url.clone(),
            guard,
        })
    }
}

#[derive(Default, Clone)]
struct Recorded {
    logs: Arc<Mutex<Vec<LogEvent>>>,
    statuses: Arc<Mutex<Vec<TunnelStatusEvent>>>,
    callbacks: Arc<Mutex<Vec<CallbackEvent>>>,
}

fn record(listener: &CallbackListener) -> Recorded {
    let rec = Recorded::default();
    let events = listener.events();
    {
        let logs = Arc::clone(&rec.logs);
        events.on_log(move |e| logs.lock().unwrap().push(e.clone()));
    }
    {
        let statuses = Arc::clone(&rec.statuses);
        events.on_tunnel_status(move |e| statuses.lock().unwrap().push(e.clone()));
    }
    {
        let callbacks = Arc::clone(&rec.callbacks);
        events.on_callback(move |e| callbacks.lock().unwrap().push(e.clone()));
    }
    rec
}

fn token() -> HandlerConfig {
    HandlerConfig::new("test-token", None)
}

/// Free port chosen by the OS, released immediately.
fn free_port() -> u16 {
    StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Occupy `n` consecutive ports and return (base, holders). Retries until a run is free.
fn occupy_run(n: u16) -> (u16, Vec<StdTcpListener>) {
    for _ in 0..50 {
        let base = free_port();
        if base.checked_add(n + 1).is_none() {
            continue;
        }
        let held: Vec<_> = (0..n)
            .map_while(|i| StdTcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, base + i))).ok())
            .collect();
        if held.len() == n as usize {
            return (base, held);
        }
    }
    panic!("could not find {} consecutive free ports", n);
}

#[tokio::test]
async fn test_skips_occupied_ports_in_order() {
    let (base, _held) = occupy_run(3);
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener = CallbackListener::with_backend(
        token(),
        ListenerOptions {
            port: base,
            max_port_attempts: 10,
        },
        backend.clone(),
    );
    let rec = record(&listener);

    listener.start().await.unwrap();

    assert_eq!(listener.bound_port(), Some(base + 3));
    let warnings: Vec<String> = rec
        .logs
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.level == Level::Warn)
        .map(|l| l.message.clone())
        .collect();
    assert_eq!(warnings.len(), 3);
    for (i, w) in warnings.iter().enumerate() {
        assert!(
            w.contains(&format!("Port {} ", base + i as u16)),
            "warning {} was {:?}",
            i,
            w
        );
    }
    assert_eq!(backend.calls.lock().unwrap()[0].local_port, base + 3);
    listener.stop().await;
}

#[tokio::test]
async fn test_tunnel_opened_only_after_server_listens() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());

    listener.start().await.unwrap();

    assert_eq!(*backend.reachable_at_connect.lock().unwrap(), vec![true]);
    listener.stop().await;
}

#[tokio::test]
async fn test_start_resolves_to_callback_url() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    let rec = record(&listener);

    let url = listener.start().await.unwrap();

    assert_eq!(url, "https://abc123.example.dev/callback");
    assert_eq!(listener.public_url(), Some(FAKE_URL));
    assert_eq!(listener.callback_url().as_deref(), Some(url.as_str()));
    let statuses = rec.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].level, Level::Info);
    assert_eq!(statuses[0].message, url);
    drop(statuses);
    listener.stop().await;
}

#[tokio::test]
async fn test_trailing_slash_trimmed_from_tunnel_url() {
    let backend = FakeBackend::ok("https://abc123.example.dev/");
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend);

    let url = listener.start().await.unwrap();

    assert_eq!(url, "https://abc123.example.dev/callback");
    listener.stop().await;
}

#[tokio::test]
async fn test_request_carries_token_and_hostname() {
    let backend = FakeBackend::ok(FAKE_URL);
    let config = HandlerConfig::new("tok-123", Some("hooks.example.dev".into()));
    let mut listener =
        CallbackListener::with_backend(config, ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());

    listener.start().await.unwrap();

    let calls = backend.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].auth_token, "tok-123");
    assert_eq!(calls[0].hostname.as_deref(), Some("hooks.example.dev"));
    assert_eq!(Some(calls[0].local_port), listener.bound_port());
    listener.stop().await;
}

#[tokio::test]
async fn test_missing_token_rejects_without_bind_or_tunnel() {
    for raw in ["", "   "] {
        let port = free_port();
        let backend = FakeBackend::ok(FAKE_URL);
        let mut listener = CallbackListener::with_backend(
            HandlerConfig::new(raw, None),
            ListenerOptions { port, max_port_attempts: 10 },
            backend.clone(),
        );
        let rec = record(&listener);

        let err = listener.start().await.unwrap_err();

        assert!(matches!(err, ListenerError::MissingCredential));
        assert_eq!(backend.call_count(), 0);
        assert_eq!(listener.bound_port(), None);
        assert!(!listener.is_running());
        assert!(rec.logs.lock().unwrap().iter().all(|l| l.level != Level::Warn));
        let statuses = rec.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].level, Level::Error);
        // The port was never taken.
        assert!(StdTcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok());
    }
}

#[tokio::test]
async fn test_tunnel_failure_closes_server() {
    let backend = FakeBackend::failing("quota exceeded");
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    let rec = record(&listener);

    let err = listener.start().await.unwrap_err();

    assert!(matches!(err, ListenerError::Tunnel(TunnelError::Connect(_))));
    assert!(err.to_string().contains("quota exceeded"));
    assert_eq!(backend.call_count(), 1);
    assert!(!listener.is_running());
    assert_eq!(listener.bound_port(), None);
    assert_eq!(listener.public_url(), None);

    let statuses = rec.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].level, Level::Error);
    assert!(statuses[0].message.contains("quota exceeded"));
    assert!(rec
        .logs
        .lock()
        .unwrap()
        .iter()
        .any(|l| l.level == Level::Error && l.message.contains("quota exceeded")));
}

#[tokio::test]
async fn test_ports_exhausted_after_max_attempts() {
    let (base, _held) = occupy_run(2);
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener = CallbackListener::with_backend(
        token(),
        ListenerOptions {
            port: base,
            max_port_attempts: 2,
        },
        backend.clone(),
    );
    let rec = record(&listener);

    let err = listener.start().await.unwrap_err();

    match err {
        ListenerError::PortsExhausted { first, last } => {
            assert_eq!(first, base);
            assert_eq!(last, base + 1);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(backend.call_count(), 0);
    let logs = rec.logs.lock().unwrap();
    assert_eq!(logs.iter().filter(|l| l.level == Level::Warn).count(), 2);
    assert_eq!(logs.last().map(|l| l.level), Some(Level::Error));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut never_started =
        CallbackListener::with_backend(token(), ListenerOptions::default(), backend.clone());
    never_started.stop().await;
    never_started.stop().await;

    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    let rec = record(&listener);
    listener.start().await.unwrap();
    let port = listener.bound_port().unwrap();

    listener.stop().await;
    listener.stop().await;

    assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.public_url(), None);
    assert_eq!(listener.bound_port(), None);
    let infos: Vec<String> = rec
        .logs
        .lock()
        .unwrap()
        .iter()
        .filter(|l| l.level == Level::Info)
        .map(|l| l.message.clone())
        .collect();
    assert!(infos.iter().any(|m| m == "Tunnel closed"));
    assert!(infos.iter().any(|m| m.contains("closed") && m.contains(&port.to_string())));
    assert!(tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
}

#[tokio::test]
async fn test_stop_closes_server_when_tunnel_close_fails() {
    let backend = FakeBackend::close_fails(FAKE_URL, "nope");
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    let rec = record(&listener);
    listener.start().await.unwrap();
    let port = listener.bound_port().unwrap();

    listener.stop().await;

    assert_eq!(backend.closed.load(Ordering::SeqCst), 1);
    assert!(!listener.is_running());
    assert_eq!(listener.public_url(), None);
    assert_eq!(listener.bound_port(), None);
    {
        let logs = rec.logs.lock().unwrap();
        let tunnel_error = logs
            .iter()
            .position(|l| {
                l.level == Level::Error
                    && l.message.contains("Error closing tunnel")
                    && l.message.contains("nope")
            })
            .expect("tunnel close error logged");
        let server_closed = logs
            .iter()
            .position(|l| {
                l.level == Level::Info && l.message == format!("Server on port {} closed", port)
            })
            .expect("server close logged");
        assert!(tunnel_error < server_closed);
        assert!(!logs.iter().any(|l| l.message == "Tunnel closed"));
    }
    assert!(tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.is_err());
}

#[tokio::test]
async fn test_second_start_while_running_is_rejected() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    listener.start().await.unwrap();

    let err = listener.start().await.unwrap_err();

    assert!(matches!(err, ListenerError::AlreadyRunning));
    assert_eq!(backend.call_count(), 1);
    listener.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend.clone());
    listener.start().await.unwrap();
    listener.stop().await;

    let url = listener.start().await.unwrap();

    assert_eq!(url, "https://abc123.example.dev/callback");
    assert_eq!(backend.call_count(), 2);
    listener.stop().await;
}

#[tokio::test]
async fn test_live_post_reaches_subscribers() {
    let backend = FakeBackend::ok(FAKE_URL);
    let mut listener =
        CallbackListener::with_backend(token(), ListenerOptions { port: 0, max_port_attempts: 1 }, backend);
    let rec = record(&listener);
    listener.start().await.unwrap();
    let port = listener.bound_port().unwrap();

    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://127.0.0.1:{}/callback?source=twilio&n=3", port))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("a=1&b=two")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), CALLBACK_RESPONSE);
    {
        let callbacks = rec.callbacks.lock().unwrap();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].body, json!({"a": "1", "b": "two"}));
        assert_eq!(callbacks[0].query_parameters["source"], "twilio");
        assert_eq!(callbacks[0].query_parameters["n"], "3");
    }
    drop(client);
    listener.stop().await;
}
