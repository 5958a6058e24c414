#![forbid(unsafe_code)]

mod demo;
mod log_sink;
mod null;

pub use demo::DemoConnector;
pub use log_sink::LoggingLocalNetwork;
pub use null::NullConnector;
