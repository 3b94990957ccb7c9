//! API request and response types.
//!
//! Wire field names are camelCase; these types face browser clients.

use serde::{Deserialize, Serialize};

/// How a staged file's `content` field is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    /// UTF-8 text written as-is
    #[serde(alias = "raw")]
    Text,

    /// Base64 payload, with or without a `data:*;base64,` prefix
    Base64,

    /// Arbitrary JSON value, pretty-printed on disk
    Json,
}

/// One client-supplied file in a create-archive batch.
#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    /// Untrusted relative path inside the session's output directory
    pub path: String,

    /// Content encoding of `content`
    #[serde(rename = "type")]
    pub kind: FileKind,

    /// Payload: a string for `text`/`base64`, any JSON value for `json`
    pub content: serde_json::Value,
}

/// Request to stage a batch of files and build the session archive.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArchiveRequest {
    /// Session identifier issued by `POST /api/session`
    pub session_id: String,

    /// Files to stage; invalid entries are skipped, not fatal
    pub files: Vec<FileEntry>,
}

/// Response after a successful archive build.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArchiveResponse {
    pub success: bool,

    /// Relative URL the archive can be downloaded from
    pub download_url: String,

    /// Entries materialized into the sandbox
    pub files_written: usize,

    /// Entries rejected by validation and skipped
    pub files_skipped: usize,
}

/// Response to an explicit session start.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_id: String,
}

/// Query for the remote-image proxy.
#[derive(Debug, Deserialize)]
pub struct FetchImageQuery {
    pub url: String,
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
