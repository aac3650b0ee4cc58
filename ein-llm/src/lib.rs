pub mod bridge;
pub mod config;
pub mod error;
pub mod hooks;
pub mod http;
pub mod logging;
pub mod models;
pub mod pool;
pub mod protocol;
pub mod transport;
pub mod worker;
