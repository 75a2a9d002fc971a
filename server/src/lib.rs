//! HookTunnel server: axum callback endpoint plus the listener that binds it and opens the tunnel.

mod listener;
mod web_server;

pub use listener::{CallbackListener, ListenerError};
pub use web_server::{router, CALLBACK_PATH, CALLBACK_RESPONSE, ROOT_MESSAGE};

/// Re-export core types so embedders only depend on this crate.
pub use hooktunnel_core::{
    config, events, payload, tunnels, CallbackEvent, Config, Events, HandlerConfig, Level,
    ListenerOptions, LogEvent, TunnelStatusEvent,
};
