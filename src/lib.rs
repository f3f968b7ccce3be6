pub mod daemon;
pub mod error;
pub mod gpmenv;
pub mod paths;
pub mod platform;
pub mod service;
pub mod store;

pub use error::{GpmError, Result};
pub use paths::Paths;
pub use service::{Service, ServiceVersion, Status};
