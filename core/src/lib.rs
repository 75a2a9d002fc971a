//! HookTunnel core: config, typed events, callback payload normalization, tunnels. No HTTP routing.

pub mod config;
pub mod events;
pub mod payload;
pub mod tunnels;

pub use config::{Config, HandlerConfig, ListenerOptions};
pub use events::{CallbackEvent, Events, Level, LogEvent, TunnelStatusEvent};
