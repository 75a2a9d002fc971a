//! Tunnels: expose the local callback listener over the internet via a public URL.
//! Providers implement TunnelBackend so the listener can dispatch uniformly (and tests can fake it).

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

mod ngrok;

pub use self::ngrok::NgrokBackend;

/// Errors from establishing or closing a tunnel.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Auth token empty or absent; detected before any network call.
    #[error("tunnel auth token not set: provide an ngrok auth token (NGROK_AUTHTOKEN or tunnel.ngrok.auth_token)")]
    MissingCredential,

    /// Provider session could not be established (bad token, quota, network).
    #[error("tunnel connect failed: {0}")]
    Connect(String),

    /// Session is up but the endpoint could not be bound (e.g. reserved hostname not owned).
    #[error("tunnel listen failed: {0}")]
    Listen(String),

    /// Provider-side disconnect failed.
    #[error("tunnel close failed: {0}")]
    Close(String),
}

/// What the listener asks the provider to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub local_port: u16,
    pub auth_token: String,
    /// Reserved/static hostname (e.g. myapp.ngrok.app). None = provider-assigned URL.
    pub hostname: Option<String>,
}

/// An established tunnel: public base URL plus the guard that keeps it alive.
#[derive(Debug)]
pub struct Tunnel {
    pub url: String,
    pub guard: TunnelGuard,
}

/// Unified tunnel backend trait: same interface for all providers.
#[async_trait]
pub trait TunnelBackend: Send + Sync {
    /// Provider id (e.g. "ngrok") for logging.
    fn name(&self) -> &'static str;

    /// Connect and start forwarding `request.local_port`. No local timeout is applied;
    /// a hang here is bounded only by the provider's own timeouts.
    async fn connect(&self, request: &TunnelRequest) -> Result<Tunnel, TunnelError>;
}

/// Keeps a tunnel alive. The provider session lives in a background task that waits for the
/// close signal, then disconnects. Dropping the guard also sends the signal.
#[derive(Debug)]
pub struct TunnelGuard {
    close_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelGuard {
    /// Wrap a task that holds the provider session. The task must return once `close_rx` fires
    /// (or its sender is dropped), reporting the outcome of the disconnect.
    pub fn new(close_tx: oneshot::Sender<()>, handle: JoinHandle<Result<(), TunnelError>>) -> Self {
        Self {
            close_tx: Some(close_tx),
            handle,
        }
    }

    /// Spawn `hold` as the session task. `hold` receives the close signal and returns the
    /// disconnect result.
    pub fn spawn<F, Fut>(hold: F) -> Self
    where
        F: FnOnce(oneshot::Receiver<()>) -> Fut,
        Fut: std::future::Future<Output = Result<(), TunnelError>> + Send + 'static,
    {
        let (close_tx, close_rx) = oneshot::channel();
        let handle = tokio::spawn(hold(close_rx));
        Self::new(close_tx, handle)
    }

    /// Signal the session task and wait for the provider disconnect to finish.
    pub async fn close(mut self) -> Result<(), TunnelError> {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        match (&mut self.handle).await {
            Ok(res) => res,
            Err(e) => Err(TunnelError::Close(format!("tunnel task: {}", e))),
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}
