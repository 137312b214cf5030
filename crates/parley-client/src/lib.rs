//! Client side of the parley protocol: registration handshake, chunked
//! upload transfer, and timeline reconciliation.
//!
//! The modules layer bottom-up: [`scheduler`] moves chunks, [`uploader`]
//! drives one upload session end to end, [`timeline`] folds server events
//! and local placeholders into a single converged view, [`registration`]
//! and [`connection`] manage the gateway handshake and transport, and
//! [`session`] ties them together.

pub mod connection;
pub mod http;
pub mod log_sink;
pub mod registration;
pub mod scheduler;
pub mod session;
pub mod timeline;
pub mod uploader;

pub use http::ApiClient;
pub use log_sink::LogSink;
pub use scheduler::{ChunkPlan, ChunkSink, TransferError};
pub use session::{ChatSession, SessionUpdate};
pub use timeline::Timeline;
pub use uploader::UploadManager;
