pub mod common;
pub mod config;
pub mod config_validation;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod reverse_proxy;
pub mod static_files;

pub use config::Config;
pub use error::GatewayError;
pub use gateway::{Gateway, Route};
