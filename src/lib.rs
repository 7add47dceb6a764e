pub mod account;
pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod keyserver;
pub mod log;
pub mod model;
pub mod notify_message;
pub mod repository;
pub mod resolver;
pub mod rpc;
pub mod spec;
pub mod storage;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod transport;
pub mod types;
pub mod utils;

pub use client::{NotifyClient, NotifyClientError};

pub type Result<T> = std::result::Result<T, NotifyClientError>;
