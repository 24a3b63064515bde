pub mod broker;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod wire;
pub mod worker;
