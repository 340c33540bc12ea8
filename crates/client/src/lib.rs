//! Composition root for the loyalty client core.
//!
//! Builds one long-lived instance of each service (state store, realtime
//! bridge, spin lock controller, navigation guard) and wires them
//! together. The `loyalty-client` binary runs it headless.

pub mod app;
pub mod config;
pub mod host;

pub use app::Client;
pub use config::ClientConfig;
pub use host::HeadlessHost;
