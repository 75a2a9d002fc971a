//! Ngrok: forward the callback listener via the ngrok Rust SDK.
//! Token and optional reserved domain come from the TunnelRequest; forwards to 127.0.0.1:<port>.

use std::sync::Once;

use ngrok::config::ForwarderBuilder;
use ngrok::tunnel::EndpointInfo;
use url::Url;

use super::{Tunnel, TunnelBackend, TunnelError, TunnelGuard, TunnelRequest};

/// Install rustls default crypto provider once (required by rustls 0.22+ before any TLS use by the ngrok SDK).
fn ensure_rustls_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        // Err means another provider is already installed, which is fine.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Start an ngrok HTTP endpoint forwarding to the local port. Returns the tunnel with its
/// public base URL.
pub async fn connect(request: &TunnelRequest) -> Result<Tunnel, TunnelError> {
    let token = request.auth_token.trim();
    if token.is_empty() {
        return Err(TunnelError::MissingCredential);
    }
    ensure_rustls_provider();

    tracing::debug!(port = request.local_port, "ngrok session connect");
    let session = ngrok::Session::builder()
        .authtoken(token)
        .connect()
        .await
        .map_err(|e| TunnelError::Connect(format!("ngrok session connect: {}", e)))?;

    let forward_url = Url::parse(&format!("http://127.0.0.1:{}", request.local_port))
        .map_err(|e| TunnelError::Listen(format!("forward URL: {}", e)))?;
    let forwarder = match request.hostname.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(domain) => {
            tracing::debug!(domain, "ngrok using reserved domain");
            session
                .http_endpoint()
                .domain(domain)
                .listen_and_forward(forward_url)
                .await
                .map_err(|e| {
                    TunnelError::Listen(format!(
                        "ngrok domain {:?} failed: {} (use a reserved domain from your ngrok dashboard)",
                        domain, e
                    ))
                })?
        }
        None => session
            .http_endpoint()
            .listen_and_forward(forward_url)
            .await
            .map_err(|e| TunnelError::Listen(format!("ngrok listen_and_forward: {}", e)))?,
    };

    let url = forwarder.url().to_string();
    tracing::debug!(%url, "ngrok endpoint online");

    // Session and forwarder must both stay alive; dropping the session takes the endpoint offline.
    let guard = TunnelGuard::spawn(move |close_rx| async move {
        let _ = close_rx.await;
        drop(forwarder);
        let mut session = session;
        session
            .close()
            .await
            .map_err(|e| TunnelError::Close(format!("ngrok session close: {}", e)))
    });

    Ok(Tunnel { url, guard })
}

/// Ngrok backend. Implements TunnelBackend for unified dispatch.
#[derive(Debug, Default, Clone, Copy)]
pub struct NgrokBackend;

#[async_trait::async_trait]
impl TunnelBackend for NgrokBackend {
    fn name(&self) -> &'static str {
        "ngrok"
    }

    async fn connect(&self, request: &TunnelRequest) -> Result<Tunnel, TunnelError> {
        connect(request).await
    }
}
