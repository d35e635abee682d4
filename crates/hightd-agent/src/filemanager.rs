use std::path::{Path, PathBuf};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::archive;
use crate::http_api::{ApiError, AppState, authorize_server};
use crate::instance::ServerInstance;
use crate::sandbox;

const READ_LIMIT: u64 = 2 * 1024 * 1024;
const UPLOAD_LIMIT: usize = 25 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/list", post(list))
        .route("/read", post(read))
        .route("/write", post(write))
        .route("/rename", post(rename))
        .route("/download", post(download))
        .route("/mkdir", post(mkdir))
        .route("/move", post(move_entry))
        .route("/upload", post(upload))
        .route("/mass", post(mass))
        .route("/unarchive", post(unarchive))
}

/// One request shape for every operation; each handler reads the fields it
/// needs and rejects what is missing.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FmBody {
    token: Option<String>,
    server_id: Option<String>,
    user_uuid: Option<String>,
    path: Option<String>,
    content: Option<String>,
    content_base64: Option<String>,
    new_name: Option<String>,
    from: Option<String>,
    to: Option<String>,
    paths: Option<Vec<String>>,
    action: Option<String>,
    archive_name: Option<String>,
    destination: Option<String>,
}

struct FmContext {
    instance: std::sync::Arc<ServerInstance>,
    base: PathBuf,
}

impl FmContext {
    fn id(&self) -> &str {
        self.instance.id()
    }

    fn resolve(&self, user_path: &str) -> Result<PathBuf, ApiError> {
        Ok(sandbox::resolve(&self.base, self.id(), user_path)?)
    }

    fn virtualize(&self, abs: &Path) -> String {
        sandbox::virtualize(&self.base, self.id(), abs)
    }

    fn root(&self) -> PathBuf {
        sandbox::server_root(&self.base, self.id())
    }
}

async fn context(state: &AppState, body: &FmBody) -> Result<FmContext, ApiError> {
    let instance =
        authorize_server(state, body.token.as_deref(), &body.server_id, &body.user_uuid).await?;
    Ok(FmContext {
        instance,
        base: state.registry.base().to_path_buf(),
    })
}

fn want<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::Input(format!("{field} is required")))
}

fn modified_ms(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

async fn metadata_of(path: &Path) -> Result<std::fs::Metadata, ApiError> {
    tokio::fs::metadata(path)
        .await
        .map_err(|_| ApiError::NotFound("no such file or directory".to_string()))
}

async fn list(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let dir = ctx.resolve(body.path.as_deref().unwrap_or("/"))?;

    let meta = metadata_of(&dir).await?;
    if !meta.is_dir() {
        return Err(ApiError::Input("path is not a directory".to_string()));
    }

    let mut entries = Vec::new();
    let mut rd = tokio::fs::read_dir(&dir)
        .await
        .map_err(|e| ApiError::Runtime(format!("read directory: {e}")))?;
    while let Some(de) = rd
        .next_entry()
        .await
        .map_err(|e| ApiError::Runtime(format!("read directory entry: {e}")))?
    {
        let name = de.file_name().to_string_lossy().into_owned();
        let Ok(meta) = de.metadata().await else {
            continue;
        };
        let is_dir = meta.is_dir();
        entries.push(json!({
            "name": name,
            "type": if is_dir { "folder" } else { "file" },
            "size": if is_dir { Value::Null } else { json!(meta.len()) },
            "lastModified": modified_ms(&meta),
            "path": ctx.virtualize(&de.path()),
        }));
    }
    entries.sort_by(|a, b| {
        a["name"]
            .as_str()
            .unwrap_or_default()
            .cmp(b["name"].as_str().unwrap_or_default())
    });

    Ok(Json(json!({ "status": "success", "entries": entries })))
}

async fn read(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;

    let meta = metadata_of(&path).await?;
    if meta.is_dir() {
        return Err(ApiError::Input("path is a directory".to_string()));
    }
    if meta.len() > READ_LIMIT {
        return Err(ApiError::PayloadTooLarge(format!(
            "file is {} bytes; the read limit is {READ_LIMIT}",
            meta.len()
        )));
    }

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Runtime(format!("read file: {e}")))?;
    Ok(Json(json!({
        "status": "success",
        "path": ctx.virtualize(&path),
        "size": meta.len(),
        "lastModified": modified_ms(&meta),
        "content": String::from_utf8_lossy(&raw),
    })))
}

async fn write(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;
    if path == ctx.root() {
        return Err(ApiError::Input("path must include a file name".to_string()));
    }
    let content = body.content.as_deref().unwrap_or_default();

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Runtime(format!("create parent directories: {e}")))?;
    }
    tokio::fs::write(&path, content)
        .await
        .map_err(|e| ApiError::Runtime(format!("write file: {e}")))?;

    Ok(Json(json!({ "status": "ok" })))
}

async fn rename(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;
    let new_name = want(&body.new_name, "newName")?;
    if new_name.contains('/') || new_name.contains('\\') {
        return Err(ApiError::Input(
            "newName must not contain path separators".to_string(),
        ));
    }

    metadata_of(&path).await?;
    let parent = path
        .parent()
        .ok_or_else(|| ApiError::Input("cannot rename the server root".to_string()))?;
    let new_path = parent.join(new_name);

    tokio::fs::rename(&path, &new_path)
        .await
        .map_err(|e| ApiError::Runtime(format!("rename: {e}")))?;

    Ok(Json(json!({
        "status": "success",
        "oldPath": ctx.virtualize(&path),
        "newPath": ctx.virtualize(&new_path),
    })))
}

async fn download(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;

    let meta = metadata_of(&path).await?;
    if meta.is_dir() {
        return Err(ApiError::Input("path is a directory".to_string()));
    }

    let raw = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::Runtime(format!("read file: {e}")))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(Json(json!({
        "status": "success",
        "fileName": file_name,
        "size": raw.len(),
        "base64": BASE64.encode(&raw),
    })))
}

async fn mkdir(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;
    if path == ctx.root() {
        return Err(ApiError::Input("path is required".to_string()));
    }

    tokio::fs::create_dir_all(&path)
        .await
        .map_err(|e| ApiError::Runtime(format!("create directory: {e}")))?;

    Ok(Json(json!({
        "status": "success",
        "path": ctx.virtualize(&path),
    })))
}

async fn move_entry(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let from_raw = want(&body.from, "from")?;
    let to_raw = want(&body.to, "to")?;

    let from = ctx.resolve(from_raw)?;
    let from_meta = metadata_of(&from).await?;
    let to = ctx.resolve(to_raw)?;

    // Moving into an existing directory (or an explicit `dir/` target)
    // keeps the source's base name.
    let into_dir = to_raw.ends_with('/')
        || tokio::fs::metadata(&to)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
    let target = if into_dir {
        let name = from
            .file_name()
            .ok_or_else(|| ApiError::Input("cannot move the server root".to_string()))?;
        to.join(name)
    } else {
        to
    };

    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Runtime(format!("create parent directories: {e}")))?;
    }
    tokio::fs::rename(&from, &target)
        .await
        .map_err(|e| ApiError::Runtime(format!("move: {e}")))?;

    Ok(Json(json!({
        "status": "success",
        "from": ctx.virtualize(&from),
        "to": ctx.virtualize(&target),
        "type": if from_meta.is_dir() { "folder" } else { "file" },
    })))
}

async fn upload(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let path = ctx.resolve(want(&body.path, "path")?)?;
    if path == ctx.root() {
        return Err(ApiError::Input("path must include a file name".to_string()));
    }

    let bytes = match (&body.content_base64, &body.content) {
        (Some(b64), _) => BASE64
            .decode(b64.trim())
            .map_err(|e| ApiError::Input(format!("invalid base64 content: {e}")))?,
        (None, Some(text)) => text.as_bytes().to_vec(),
        (None, None) => {
            return Err(ApiError::Input(
                "content or contentBase64 is required".to_string(),
            ));
        }
    };
    if bytes.len() > UPLOAD_LIMIT {
        return Err(ApiError::PayloadTooLarge(format!(
            "upload is {} bytes; the limit is {UPLOAD_LIMIT}",
            bytes.len()
        )));
    }

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ApiError::Runtime(format!("create parent directories: {e}")))?;
    }
    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| ApiError::Runtime(format!("write file: {e}")))?;

    Ok(Json(json!({
        "status": "success",
        "path": ctx.virtualize(&path),
        "size": bytes.len(),
    })))
}

fn safe_archive_name(raw: Option<&str>) -> String {
    let fallback = || format!("archive-{}", chrono::Utc::now().timestamp_millis());
    match raw {
        Some(name) => {
            let cleaned: String = name
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
                .collect();
            let cleaned = cleaned.trim().trim_end_matches(".zip").to_string();
            if cleaned.is_empty() { fallback() } else { cleaned }
        }
        None => fallback(),
    }
}

async fn mass(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let action = want(&body.action, "action")?;
    let paths = body
        .paths
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::Input("paths is required".to_string()))?;

    match action {
        "delete" => {
            let mut results = Vec::with_capacity(paths.len());
            for raw in paths {
                let outcome: Result<(), String> = async {
                    let path = ctx
                        .resolve(raw)
                        .map_err(|_| "path escapes the server directory".to_string())?;
                    let meta = tokio::fs::symlink_metadata(&path)
                        .await
                        .map_err(|e| e.to_string())?;
                    if meta.is_dir() {
                        tokio::fs::remove_dir_all(&path).await.map_err(|e| e.to_string())
                    } else {
                        tokio::fs::remove_file(&path).await.map_err(|e| e.to_string())
                    }
                }
                .await;
                results.push(json!({
                    "path": raw,
                    "ok": outcome.is_ok(),
                    "error": outcome.err(),
                }));
            }
            Ok(Json(json!({ "status": "success", "results": results })))
        }
        "archive" => {
            let name = safe_archive_name(body.archive_name.as_deref());
            let out = ctx.root().join(format!("{name}.zip"));

            let mut entries: Vec<(String, PathBuf)> = Vec::new();
            let mut results = Vec::with_capacity(paths.len());
            for raw in paths {
                match ctx.resolve(raw) {
                    Ok(abs) if abs != ctx.root() => {
                        let rel = ctx.virtualize(&abs).trim_start_matches('/').to_string();
                        let exists = tokio::fs::symlink_metadata(&abs).await.is_ok();
                        results.push(json!({
                            "path": raw,
                            "ok": exists,
                            "error": if exists { Value::Null } else { json!("no such file or directory") },
                        }));
                        if exists {
                            entries.push((rel, abs));
                        }
                    }
                    _ => {
                        results.push(json!({
                            "path": raw,
                            "ok": false,
                            "error": "invalid path",
                        }));
                    }
                }
            }

            let archive_path = out.clone();
            tokio::task::spawn_blocking(move || archive::create_zip(&entries, &archive_path))
                .await
                .map_err(|e| ApiError::Runtime(format!("archive task: {e}")))?
                .map_err(|e| ApiError::Runtime(format!("create archive: {e}")))?;

            Ok(Json(json!({
                "status": "success",
                "results": results,
                "archive": ctx.virtualize(&out),
            })))
        }
        other => Err(ApiError::Input(format!("unknown mass action {other:?}"))),
    }
}

async fn unarchive(
    State(state): State<AppState>,
    Json(body): Json<FmBody>,
) -> Result<Json<Value>, ApiError> {
    let ctx = context(&state, &body).await?;
    let archive_path = ctx.resolve(want(&body.path, "path")?)?;
    metadata_of(&archive_path).await?;

    let file_name = archive_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = archive::detect_kind(&file_name)
        .ok_or_else(|| ApiError::Input(format!("unsupported archive format: {file_name}")))?;
    let base_name = archive::derived_base_name(&file_name);

    let caller_destination = body
        .destination
        .as_deref()
        .filter(|d| !d.trim().is_empty());
    let dest = ctx.resolve(caller_destination.unwrap_or(base_name.as_str()))?;
    if dest == ctx.root() {
        return Err(ApiError::Input("destination is required".to_string()));
    }

    let scan_path = archive_path.clone();
    let entries = tokio::task::spawn_blocking(move || archive::list_entries(&scan_path, kind))
        .await
        .map_err(|e| ApiError::Runtime(format!("archive task: {e}")))?
        .map_err(|e| ApiError::Input(format!("read archive: {e}")))?;

    // Strip a redundant top-level directory only when the caller chose the
    // destination and the archive is a single tree named after itself.
    let flattened =
        caller_destination.is_some() && archive::single_top_level(&entries, &base_name);

    let strip = flattened.then(|| base_name.clone());
    let extract_archive = archive_path.clone();
    let extract_dest = dest.clone();
    let results = tokio::task::spawn_blocking(move || {
        archive::extract(&extract_archive, kind, &extract_dest, strip.as_deref())
    })
    .await
    .map_err(|e| ApiError::Runtime(format!("archive task: {e}")))?
    .map_err(|e| ApiError::Runtime(format!("extract archive: {e}")))?;

    let results: Vec<Value> = results
        .into_iter()
        .map(|r| {
            json!({
                "entry": r.entry,
                "ok": r.ok,
                "error": r.error,
            })
        })
        .collect();

    Ok(Json(json!({
        "status": "success",
        "archive": ctx.virtualize(&archive_path),
        "destination": ctx.virtualize(&dest),
        "flattened": flattened,
        "results": results,
    })))
}
