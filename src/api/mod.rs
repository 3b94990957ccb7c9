//! HTTP API for the staging service.
//!
//! ## Endpoints
//!
//! - `POST /api/session` - Start a session and receive its identifier
//! - `POST /api/create-archive` - Stage a batch of files and build the session archive
//! - `GET /api/download/{session_id}/{filename}` - Download an archive
//! - `GET /api/fetch-image?url=...` - Proxy a remote image fetch
//! - `GET /api/health` - Health check

mod proxy;
mod routes;
mod stage;
pub mod types;

pub use routes::serve;
pub use types::*;
