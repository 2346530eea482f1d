//! HTTP transport for the upload server.
//!
//! Implements `chunkup_uploader::UploadTransport` on top of `reqwest`,
//! attaching the session's Bearer token and classifying envelope errors.

mod client;
mod session;

pub use client::{HttpError, HttpTransport};
pub use session::{MemorySession, SessionStore};
