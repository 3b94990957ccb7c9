//! Staging flow: session start, batch file intake, archive download.
//!
//! The batch handler is deliberately tolerant: one bad file entry is logged
//! and skipped, the rest of the batch proceeds. The archive build at the end
//! is the opposite, all-or-nothing. Downloads stream the archive and only
//! schedule sandbox deletion once the response stream has ended cleanly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use crate::archive;
use crate::cleanup::CleanupScheduler;
use crate::config::LimitsConfig;
use crate::error::ApiError;
use crate::paths::{self, PathRejection};
use crate::session::SessionRegistry;
use crate::sniff;

use super::routes::AppState;
use super::types::{
    CreateArchiveRequest, CreateArchiveResponse, FileEntry, FileKind, SessionResponse,
};

/// Longest accepted download file name.
const MAX_FILENAME_LEN: usize = 128;

/// Why a single batch entry was skipped.
#[derive(Debug, thiserror::Error)]
enum StageRejection {
    #[error(transparent)]
    Path(#[from] PathRejection),

    #[error("content is not a string")]
    ContentNotString,

    #[error("base64 payload did not decode")]
    BadBase64,

    #[error("json content did not serialize")]
    BadJson,

    #[error("payload exceeds the per-file size limit")]
    Oversize,

    #[error("path collides with an already-staged entry")]
    PathConflict,
}

enum StageOutcome {
    Written,
    Skipped(StageRejection),
}

/// `POST /api/session`: issue a fresh identifier and create its sandbox.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<SessionResponse>), ApiError> {
    let session_id = state.sessions.issue();
    state.sessions.ensure_output_dir(&session_id).await?;

    tracing::info!(session = %&session_id[..8], "session started");
    Ok((StatusCode::CREATED, Json(SessionResponse { session_id })))
}

/// `POST /api/create-archive`: stage a batch of files, then build the
/// session archive.
pub async fn create_archive(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateArchiveRequest>,
) -> Result<Json<CreateArchiveResponse>, ApiError> {
    let limits = &state.config.limits;

    if !SessionRegistry::is_valid_id(&req.session_id) {
        return Err(ApiError::invalid(format!(
            "malformed session identifier ({} chars)",
            req.session_id.len()
        )));
    }
    if req.files.is_empty() {
        return Err(ApiError::invalid("empty file batch"));
    }
    if req.files.len() > limits.max_batch_files {
        return Err(ApiError::invalid(format!(
            "batch of {} files exceeds the cap of {}",
            req.files.len(),
            limits.max_batch_files
        )));
    }

    let output_dir = state.sessions.ensure_output_dir(&req.session_id).await?;

    let mut written = 0usize;
    let mut skipped = 0usize;
    for entry in &req.files {
        match stage_file(&output_dir, entry, limits).await? {
            StageOutcome::Written => written += 1,
            StageOutcome::Skipped(rejection) => {
                skipped += 1;
                log_rejection(&req.session_id, &entry.path, &rejection);
            }
        }
    }

    let sandbox = state.sessions.sandbox_path(&req.session_id)?;
    let file_name = archive::archive_file_name();
    let dest = sandbox.join(&file_name);

    // Zip compression is synchronous; keep it off the async workers.
    let source = output_dir.clone();
    let size = tokio::task::spawn_blocking(move || archive::build_archive(&source, &dest))
        .await
        .map_err(ApiError::storage)??;

    tracing::info!(
        session = %&req.session_id[..8],
        files = written,
        skipped,
        bytes = size,
        "archive built"
    );

    Ok(Json(CreateArchiveResponse {
        success: true,
        download_url: format!("/api/download/{}/{}", req.session_id, file_name),
        files_written: written,
        files_skipped: skipped,
    }))
}

/// `GET /api/download/{session_id}/{filename}`: stream an archive and
/// schedule sandbox deletion once delivery completes.
pub async fn download_archive(
    State(state): State<Arc<AppState>>,
    UrlPath((session_id, filename)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    if !SessionRegistry::is_valid_id(&session_id) {
        return Err(ApiError::invalid(format!(
            "malformed session identifier ({} chars)",
            session_id.len()
        )));
    }
    if !is_safe_download_name(&filename) {
        return Err(ApiError::invalid("malformed archive file name"));
    }

    let sandbox = state.sessions.sandbox_path(&session_id)?;
    let path = paths::safe_join(&sandbox, Path::new(&filename))
        .map_err(|_| ApiError::violation("download path escapes its sandbox"))?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ApiError::NotFound),
        Err(e) => return Err(e.into()),
    };
    // Opening a directory succeeds on Linux; only regular files are served.
    // Anything else would commit a 200 whose body stream can never complete.
    let meta = file.metadata().await?;
    if !meta.is_file() {
        return Err(ApiError::NotFound);
    }
    let len = meta.len();

    tracing::info!(
        session = %&session_id[..8],
        file = %filename,
        bytes = len,
        "archive download started"
    );

    let stream = finish_then_schedule(
        ReaderStream::new(file),
        state.cleanup.clone(),
        session_id,
        sandbox,
    );

    let headers = [
        (header::CONTENT_TYPE, "application/zip".to_string()),
        (header::CONTENT_LENGTH, len.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        ),
    ];
    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Run one file entry through the validation pipeline and write it.
///
/// Validation rejections and name collisions skip the entry; other disk
/// errors abort the request.
async fn stage_file(
    output_dir: &Path,
    entry: &FileEntry,
    limits: &LimitsConfig,
) -> Result<StageOutcome, ApiError> {
    let relative = match paths::sanitize_relative_path(&entry.path) {
        Ok(relative) => relative,
        Err(rejection) => return Ok(StageOutcome::Skipped(rejection.into())),
    };

    let bytes = match decode_content(entry, limits.max_file_bytes) {
        Ok(bytes) => bytes,
        Err(rejection) => return Ok(StageOutcome::Skipped(rejection)),
    };
    if !sniff::within_size_limit(bytes.len(), limits.max_file_bytes) {
        return Ok(StageOutcome::Skipped(StageRejection::Oversize));
    }

    if !paths::is_allowed_extension(&relative, &limits.allowed_extensions) {
        return Ok(StageOutcome::Skipped(
            PathRejection::DisallowedExtension.into(),
        ));
    }

    let target = match paths::safe_join(output_dir, &relative) {
        Ok(target) => target,
        Err(rejection) => return Ok(StageOutcome::Skipped(rejection.into())),
    };

    if let Err(e) = write_entry(&target, &bytes).await {
        // Entries of one batch can collide file-vs-directory after
        // sanitization ("a.json" next to "a.json/b.json"). That is a bad
        // entry, not a storage fault, so it skips like the rest.
        return match e.kind() {
            std::io::ErrorKind::AlreadyExists
            | std::io::ErrorKind::IsADirectory
            | std::io::ErrorKind::NotADirectory => {
                Ok(StageOutcome::Skipped(StageRejection::PathConflict))
            }
            _ => Err(e.into()),
        };
    }
    Ok(StageOutcome::Written)
}

async fn write_entry(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(target, bytes).await
}

/// Decode an entry's payload according to its declared kind.
///
/// Base64 payloads are size-checked before decoding as well as after, since
/// decoding shrinks them by a third; the post-decode check in the caller is
/// the authoritative one.
fn decode_content(entry: &FileEntry, max_file_bytes: usize) -> Result<Vec<u8>, StageRejection> {
    match entry.kind {
        FileKind::Text => {
            let text = entry
                .content
                .as_str()
                .ok_or(StageRejection::ContentNotString)?;
            Ok(text.as_bytes().to_vec())
        }
        FileKind::Base64 => {
            let raw = entry
                .content
                .as_str()
                .ok_or(StageRejection::ContentNotString)?;
            // Browser canvases hand over data URLs; accept both shapes.
            let payload = match raw.split_once(";base64,") {
                Some((prefix, rest)) if prefix.starts_with("data:") => rest,
                _ => raw,
            };
            if !sniff::within_size_limit(payload.len(), sniff::max_encoded_len(max_file_bytes)) {
                return Err(StageRejection::Oversize);
            }
            base64::engine::general_purpose::STANDARD
                .decode(payload.trim())
                .map_err(|_| StageRejection::BadBase64)
        }
        FileKind::Json => {
            serde_json::to_vec_pretty(&entry.content).map_err(|_| StageRejection::BadJson)
        }
    }
}

fn log_rejection(session_id: &str, raw_path: &str, rejection: &StageRejection) {
    match rejection {
        StageRejection::Path(PathRejection::Traversal) => {
            tracing::warn!(
                target: "audit",
                session = %&session_id[..8],
                path = %raw_path,
                "path traversal attempt skipped"
            );
        }
        other => {
            tracing::warn!(
                session = %&session_id[..8],
                path = %raw_path,
                reason = %other,
                "file entry skipped"
            );
        }
    }
}

/// Download names are a tight whitelist: ASCII alphanumerics plus `. - _`,
/// no leading dot, bounded length. The archive names this service generates
/// always pass.
fn is_safe_download_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FILENAME_LEN
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// Pass a byte stream through and, if it ends without an error, schedule the
/// sandbox for deferred deletion. A client that disconnects mid-transfer
/// keeps its sandbox and may retry.
fn finish_then_schedule(
    inner: impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send + 'static,
    scheduler: CleanupScheduler,
    session_id: String,
    sandbox: PathBuf,
) -> impl futures::Stream<Item = Result<bytes::Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut stream = std::pin::pin!(inner);
        let mut errored = false;
        while let Some(item) = stream.next().await {
            if item.is_err() {
                errored = true;
            }
            yield item;
        }
        if !errored {
            scheduler.schedule_removal(&session_id, sandbox);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Read;
    use std::time::Duration;

    fn test_state(root: &Path, cleanup: Duration) -> Arc<AppState> {
        let mut config = Config::new(root.to_path_buf());
        config.cleanup_delay = cleanup;
        AppState::from_config(config).expect("state must build")
    }

    fn entry(path: &str, kind: FileKind, content: serde_json::Value) -> FileEntry {
        FileEntry {
            path: path.to_string(),
            kind,
            content,
        }
    }

    async fn start_session(state: &Arc<AppState>) -> String {
        let (status, Json(resp)) = create_session(State(Arc::clone(state))).await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        resp.session_id
    }

    async fn push_batch(
        state: &Arc<AppState>,
        session_id: &str,
        files: Vec<FileEntry>,
    ) -> Result<CreateArchiveResponse, ApiError> {
        let req = CreateArchiveRequest {
            session_id: session_id.to_string(),
            files,
        };
        create_archive(State(Arc::clone(state)), Json(req))
            .await
            .map(|Json(resp)| resp)
    }

    fn open_archive(root: &Path, session_id: &str, download_url: &str) -> zip::ZipArchive<std::fs::File> {
        let file_name = download_url.rsplit('/').next().unwrap();
        let path = root.join(session_id).join(file_name);
        zip::ZipArchive::new(std::fs::File::open(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn batch_stages_files_and_builds_archive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));
        let session_id = start_session(&state).await;

        let png = base64::engine::general_purpose::STANDARD.encode([0x89, 0x50, 0x4E, 0x47, 0, 0]);
        let resp = push_batch(
            &state,
            &session_id,
            vec![
                entry("a/b.json", FileKind::Json, serde_json::json!({"x": 1})),
                entry("index.html", FileKind::Text, serde_json::json!("<html></html>")),
                entry(
                    "tex/skin.png",
                    FileKind::Base64,
                    serde_json::json!(format!("data:image/png;base64,{png}")),
                ),
            ],
        )
        .await
        .expect("batch must succeed");

        assert!(resp.success);
        assert_eq!(resp.files_written, 3);
        assert_eq!(resp.files_skipped, 0);
        assert!(resp
            .download_url
            .starts_with(&format!("/api/download/{session_id}/")));

        let mut archive = open_archive(dir.path(), &session_id, &resp.download_url);
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a/b.json", "index.html", "tex/skin.png"]);

        // JSON content lands pretty-printed.
        let mut bytes = Vec::new();
        archive
            .by_name("a/b.json")
            .unwrap()
            .read_to_end(&mut bytes)
            .unwrap();
        assert_eq!(
            bytes,
            serde_json::to_vec_pretty(&serde_json::json!({"x": 1})).unwrap()
        );
    }

    #[tokio::test]
    async fn traversal_entries_are_skipped_without_failing_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));
        let session_id = start_session(&state).await;

        let resp = push_batch(
            &state,
            &session_id,
            vec![
                entry("keep.txt", FileKind::Text, serde_json::json!("ok")),
                entry(
                    "../../etc/passwd",
                    FileKind::Text,
                    serde_json::json!("root:x:0:0"),
                ),
            ],
        )
        .await
        .expect("batch must still succeed");

        assert_eq!(resp.files_written, 1);
        assert_eq!(resp.files_skipped, 1);

        // Nothing escaped the sandbox.
        assert!(!dir.path().join("etc").exists());
        assert!(!dir.path().join("etc/passwd").exists());

        let mut archive = open_archive(dir.path(), &session_id, &resp.download_url);
        assert_eq!(archive.len(), 1);
        assert_eq!(archive.by_index(0).unwrap().name(), "keep.txt");
    }

    #[tokio::test]
    async fn skips_invalid_entries_and_keeps_the_rest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(dir.path().to_path_buf());
        config.limits.max_file_bytes = 16;
        let state = AppState::from_config(config).unwrap();
        let session_id = start_session(&state).await;

        let resp = push_batch(
            &state,
            &session_id,
            vec![
                entry("small.txt", FileKind::Text, serde_json::json!("tiny")),
                entry(
                    "big.txt",
                    FileKind::Text,
                    serde_json::json!("x".repeat(17)),
                ),
                entry("tool.exe", FileKind::Text, serde_json::json!("MZ")),
                entry("bad.png", FileKind::Base64, serde_json::json!("!!!not-base64!!!")),
                entry("no-string.txt", FileKind::Text, serde_json::json!(42)),
            ],
        )
        .await
        .unwrap();

        assert_eq!(resp.files_written, 1);
        assert_eq!(resp.files_skipped, 4);
    }

    #[tokio::test]
    async fn colliding_entries_skip_rather_than_fail_the_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));
        let session_id = start_session(&state).await;

        // "a.json" lands as a file, so "a.json/b.json" cannot have its
        // directory; "d.json" arrives after "d.json/inner.json" made it a
        // directory. Both collide in either order, and neither may turn a
        // staging batch into a 500.
        let resp = push_batch(
            &state,
            &session_id,
            vec![
                entry("a.json", FileKind::Json, serde_json::json!(1)),
                entry("a.json/b.json", FileKind::Json, serde_json::json!(2)),
                entry("d.json/inner.json", FileKind::Json, serde_json::json!(3)),
                entry("d.json", FileKind::Json, serde_json::json!(4)),
                entry("ok.txt", FileKind::Text, serde_json::json!("fine")),
            ],
        )
        .await
        .expect("collisions skip, the batch still succeeds");

        assert_eq!(resp.files_written, 3);
        assert_eq!(resp.files_skipped, 2);

        let mut archive = open_archive(dir.path(), &session_id, &resp.download_url);
        let mut names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.json", "d.json/inner.json", "ok.txt"]);
    }

    #[tokio::test]
    async fn rejects_malformed_sessions_and_bad_batches_before_io() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));

        let err = push_batch(
            &state,
            "not-a-session",
            vec![entry("a.txt", FileKind::Text, serde_json::json!("x"))],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));

        // No sandbox may appear for a rejected identifier.
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(entries.is_empty());

        let session_id = start_session(&state).await;
        let err = push_batch(&state, &session_id, vec![]).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn enforces_the_batch_cap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new(dir.path().to_path_buf());
        config.limits.max_batch_files = 2;
        let state = AppState::from_config(config).unwrap();
        let session_id = start_session(&state).await;

        let files = (0..3)
            .map(|i| entry(&format!("f{i}.txt"), FileKind::Text, serde_json::json!("x")))
            .collect();
        let err = push_batch(&state, &session_id, files).await.unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn download_streams_the_archive_and_schedules_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_millis(40));
        let session_id = start_session(&state).await;

        let resp = push_batch(
            &state,
            &session_id,
            vec![entry("f.txt", FileKind::Text, serde_json::json!("data"))],
        )
        .await
        .unwrap();
        let file_name = resp.download_url.rsplit('/').next().unwrap().to_string();

        let response = download_archive(
            State(Arc::clone(&state)),
            UrlPath((session_id.clone(), file_name.clone())),
        )
        .await
        .expect("download must succeed");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/zip"
        );
        assert!(response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .contains(&file_name));

        // Drain the body; delivery completion arms the cleanup timer.
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(body.to_vec())).unwrap();
        assert_eq!(archive.len(), 1);
        let mut content = String::new();
        archive
            .by_name("f.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "data");

        assert_eq!(state.cleanup.pending_count(), 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!dir.path().join(&session_id).exists());

        // A late retry after cleanup observes not-found.
        let err = download_archive(
            State(Arc::clone(&state)),
            UrlPath((session_id, file_name)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));
    }

    #[tokio::test]
    async fn download_rejects_unsafe_names_and_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));
        let session_id = start_session(&state).await;

        for name in ["../export.zip", "..", ".hidden.zip", "a b.zip", ""] {
            let err = download_archive(
                State(Arc::clone(&state)),
                UrlPath((session_id.clone(), name.to_string())),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, ApiError::InvalidInput(_)), "{name}");
        }

        let err = download_archive(
            State(Arc::clone(&state)),
            UrlPath(("zzz".to_string(), "export.zip".to_string())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn download_refuses_directories_inside_the_sandbox() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = test_state(dir.path(), Duration::from_secs(60));
        let session_id = start_session(&state).await;

        // "output" passes the name whitelist and resolves inside the
        // sandbox, but it names the staging directory. Serving it would
        // commit a 200 whose body stream dies on the first read.
        let err = download_archive(
            State(Arc::clone(&state)),
            UrlPath((session_id.clone(), "output".to_string())),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ApiError::NotFound));

        // A refused download must not schedule the sandbox for removal.
        assert_eq!(state.cleanup.pending_count(), 0);
        assert!(dir.path().join(&session_id).join("output").is_dir());
    }

    #[test]
    fn download_name_whitelist() {
        assert!(is_safe_download_name("export-20250101-010101.zip"));
        assert!(is_safe_download_name("bundle_v2.zip"));
        assert!(!is_safe_download_name(""));
        assert!(!is_safe_download_name(".dotfile"));
        assert!(!is_safe_download_name("a/b.zip"));
        assert!(!is_safe_download_name("name with space.zip"));
        assert!(!is_safe_download_name(&"a".repeat(MAX_FILENAME_LEN + 1)));
    }
}
