//! Callback listener: bind a local port (next port up on conflict, bounded), serve the callback
//! router there, then open a tunnel to it. Owns the server and tunnel lifetimes.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hooktunnel_core::config::{HandlerConfig, ListenerOptions};
use hooktunnel_core::events::{Events, Level};
use hooktunnel_core::tunnels::{NgrokBackend, TunnelBackend, TunnelError, TunnelGuard, TunnelRequest};

use crate::web_server::{self, CALLBACK_PATH};

/// The tunnel forwards to loopback, so the listener only binds there.
const BIND_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("listener already running")]
    AlreadyRunning,

    #[error("tunnel auth token is missing or empty")]
    MissingCredential,

    #[error("failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no free port in {first}..={last}")]
    PortsExhausted { first: u16, last: u16 },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Running axum server: shutdown signal plus the serve task.
struct ServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<io::Result<()>>,
}

impl ServerHandle {
    fn spawn(listener: TcpListener, events: Events) -> Self {
        let app = web_server::router(events);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        Self {
            shutdown_tx: Some(shutdown_tx),
            join,
        }
    }

    /// Signal graceful shutdown and wait for the serve task to finish.
    async fn close(mut self) -> io::Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.join).await {
            Ok(res) => res,
            Err(e) => Err(io::Error::other(format!("server task: {}", e))),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Lifecycle state. `public_url` is only ever set while `server` is.
#[derive(Default)]
struct ListenerState {
    bound_port: Option<u16>,
    public_url: Option<String>,
    server: Option<ServerHandle>,
    tunnel: Option<TunnelGuard>,
}

/// Exposes a local POST /callback endpoint through a tunnel and republishes each request as a
/// `CallbackEvent`. Subscribe via `events()` before calling `start()`.
pub struct CallbackListener {
    config: HandlerConfig,
    options: ListenerOptions,
    backend: Arc<dyn TunnelBackend>,
    events: Events,
    state: ListenerState,
}

impl CallbackListener {
    /// Listener with the ngrok backend and default options (port 4000).
    pub fn new(config: HandlerConfig) -> Self {
        Self::with_backend(config, ListenerOptions::default(), Arc::new(NgrokBackend))
    }

    pub fn with_options(config: HandlerConfig, options: ListenerOptions) -> Self {
        Self::with_backend(config, options, Arc::new(NgrokBackend))
    }

    pub fn with_backend(
        config: HandlerConfig,
        options: ListenerOptions,
        backend: Arc<dyn TunnelBackend>,
    ) -> Self {
        Self {
            config,
            options,
            backend,
            events: Events::new(),
            state: ListenerState::default(),
        }
    }

    /// Event hub for `log`, `callback` and `tunnel_status` subscriptions.
    pub fn events(&self) -> &Events {
        &self.events
    }

    /// Tunnel base URL (without `/callback`), if the tunnel is up.
    pub fn public_url(&self) -> Option<&str> {
        self.state.public_url.as_deref()
    }

    /// Full URL external services should POST to.
    pub fn callback_url(&self) -> Option<String> {
        self.public_url().map(|base| format!("{}{}", base, CALLBACK_PATH))
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.state.bound_port
    }

    pub fn is_running(&self) -> bool {
        self.state.server.is_some()
    }

    /// Bind, serve, tunnel. Resolves to `<public-base>/callback`.
    ///
    /// On tunnel failure the bound server is closed again, so a failed start holds nothing.
    pub async fn start(&mut self) -> Result<String, ListenerError> {
        self.start_with(TcpListener::bind).await
    }

    /// `start` with the per-port bind step supplied by the caller.
    async fn start_with<B, Fut>(&mut self, bind: B) -> Result<String, ListenerError>
    where
        B: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = io::Result<TcpListener>>,
    {
        if self.is_running() {
            return Err(ListenerError::AlreadyRunning);
        }
        let Some(token) = self.config.auth_token().map(str::to_string) else {
            let err = ListenerError::MissingCredential;
            self.events.log(Level::Error, format!("Cannot start: {}", err));
            self.events.tunnel_status(Level::Error, err.to_string());
            return Err(err);
        };

        let (listener, port) = self.bind(bind).await?;
        self.state.server = Some(ServerHandle::spawn(listener, self.events.clone()));
        self.state.bound_port = Some(port);
        self.events
            .log(Level::Info, format!("Listening on http://{}:{}", BIND_HOST, port));

        let request = TunnelRequest {
            local_port: port,
            auth_token: token,
            hostname: self.config.reserved_hostname.clone(),
        };
        tracing::debug!(backend = self.backend.name(), port, "opening tunnel");
        match self.backend.connect(&request).await {
            Ok(tunnel) => {
                let base = tunnel.url.trim_end_matches('/').to_string();
                let callback_url = format!("{}{}", base, CALLBACK_PATH);
                self.state.public_url = Some(base);
                self.state.tunnel = Some(tunnel.guard);
                self.events.tunnel_status(Level::Info, callback_url.clone());
                Ok(callback_url)
            }
            Err(e) => {
                self.events.log(
                    Level::Error,
                    format!("Tunnel ({}) failed: {}", self.backend.name(), e),
                );
                self.events.tunnel_status(Level::Error, e.to_string());
                self.close_server().await;
                Err(ListenerError::Tunnel(e))
            }
        }
    }

    /// Sequential bind attempts from `options.port`. Only `AddrInUse` moves on to the next port.
    async fn bind<B, Fut>(&self, mut bind: B) -> Result<(TcpListener, u16), ListenerError>
    where
        B: FnMut(SocketAddr) -> Fut,
        Fut: Future<Output = io::Result<TcpListener>>,
    {
        let first = self.options.port;
        let attempts = self.options.max_port_attempts.max(1);
        let mut port = first;
        let mut tried: u32 = 0;
        loop {
            tried += 1;
            match bind(SocketAddr::from((BIND_HOST, port))).await {
                Ok(listener) => {
                    // Port 0 asks the OS for any free port; report the real one.
                    let actual = listener.local_addr().map(|a| a.port()).unwrap_or(port);
                    return Ok((listener, actual));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    self.events
                        .log(Level::Warn, format!("Port {} is in use, trying next port", port));
                    let next = port.checked_add(1).filter(|_| tried < attempts);
                    match next {
                        Some(n) => port = n,
                        None => {
                            let err = ListenerError::PortsExhausted { first, last: port };
                            self.events.log(Level::Error, err.to_string());
                            return Err(err);
                        }
                    }
                }
                Err(source) => {
                    let err = ListenerError::Bind { port, source };
                    self.events.log(Level::Error, err.to_string());
                    return Err(err);
                }
            }
        }
    }

    /// Close the tunnel, then the server. Each step is best-effort; failures are logged only.
    /// Calling this when nothing runs is a no-op.
    pub async fn stop(&mut self) {
        self.state.public_url = None;
        if let Some(guard) = self.state.tunnel.take() {
            match guard.close().await {
                Ok(()) => self.events.log(Level::Info, "Tunnel closed"),
                Err(e) => self
                    .events
                    .log(Level::Error, format!("Error closing tunnel: {}", e)),
            }
        }
        self.close_server().await;
    }

    async fn close_server(&mut self) {
        self.state.public_url = None;
        let port = self.state.bound_port.take();
        if let Some(server) = self.state.server.take() {
            match server.close().await {
                Ok(()) => self.events.log(
                    Level::Info,
                    format!("Server on port {} closed", port.unwrap_or_default()),
                ),
                Err(e) => self
                    .events
                    .log(Level::Error, format!("Error closing server: {}", e)),
            }
        }
    }
}

impl std::fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackListener")
            .field("config", &self.config)
            .field("options", &self.options)
            .field("backend", &self.backend.name())
            .field("bound_port", &self.state.bound_port)
            .field("public_url", &self.state.public_url)
            .finish()
    }
}
