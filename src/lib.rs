//! # Dropstage
//!
//! Staging server for browser-built artifacts: a client opens a session,
//! pushes the files it generated, and downloads them back as a single zip
//! archive. A small image proxy works around canvas CORS tainting.
//!
//! ## Session Flow
//! 1. `POST /api/session` issues an unguessable session identifier and a
//!    matching disk sandbox
//! 2. `POST /api/create-archive` stages the batch into the sandbox and zips it
//! 3. `GET /api/download/{id}/{file}` streams the archive; the sandbox is
//!    deleted shortly after delivery completes
//!
//! ## Modules
//! - `api`: HTTP endpoints, router, and server lifecycle
//! - `session`: identifier issuance and sandbox mapping
//! - `paths`: relative-path sanitizing and containment checks
//! - `ssrf`: outbound-fetch policy for the image proxy

pub mod api;
pub mod archive;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod paths;
pub mod session;
pub mod sniff;
pub mod ssrf;

pub use config::Config;
