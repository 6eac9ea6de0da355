//! Core types for RustQueue
//!
//! This crate provides the error codes and caller-facing error shape
//! shared by the queue engine, the authorization layer and the server.

pub mod error;
pub mod request_id;

pub use error::{ApiError, ErrorCode};
pub use request_id::RequestId;
