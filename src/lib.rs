pub mod activity;
pub mod api;
pub mod cleanup;
pub mod config;
pub mod delegate;
pub mod error;
pub mod events;
pub mod hooks;
pub mod protocol;
pub mod run;
pub mod sdk_config;
pub mod server;
pub mod transport;
pub mod watcher;
