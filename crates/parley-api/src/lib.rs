//! parley-api: wire types and backend client
//!
//! This crate holds the message model shared with the chat backend, the
//! streaming event protocol, request validation, and an HTTP client for the
//! streaming, models, history and upload endpoints.

pub mod client;
pub mod error;
pub mod request;
pub mod stream;
pub mod types;

pub use client::ChatClient;
pub use error::{Error, Result};
pub use request::ChatStreamRequest;
pub use stream::{FinishStatus, StreamEvent, StreamEventStream};
pub use types::*;
