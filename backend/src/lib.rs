pub mod config;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod protocol;
pub mod request;
pub mod routes;
pub mod scoring;

pub use dispatch::DispatchPool;
pub use error::TaggerError;
