//! Content libraries: listing, and downloading an item's files through a
//! download session.

use super::{observe, OpContext, Operation};
use crate::api::{HttpMethod, RestApi};
use crate::diff::{diff, Comparator, DesiredSpec, Progress};
use crate::props::{str_at, string_at};
use crate::types::InventoryKind;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use vsops_core::{OpResult, VsError, VsResult};

const LIBRARY_PATH: &str = "/api/content/library";
const SESSION_PATH: &str = "/api/content/library/item/download-session";
const PREPARE_POLL: Duration = Duration::from_secs(1);

// ── content_library_info ────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ContentLibraryInfo {
    /// Limit the details to one library.
    #[serde(default)]
    pub library_id: Option<String>,
}

fn library_row(lib: &Value) -> Value {
    json!({
        "library_id": string_at(lib, "id"),
        "library_name": string_at(lib, "name"),
        "library_description": string_at(lib, "description"),
        "library_type": string_at(lib, "type"),
        "library_creation_time": string_at(lib, "creation_time"),
        "library_server_guid": string_at(lib, "server_guid"),
        "library_version": string_at(lib, "version"),
    })
}

#[async_trait]
impl Operation for ContentLibraryInfo {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let rest = ctx.rest();
        let ids = observe(|| rest.get(LIBRARY_PATH)).await?;
        let mut ids: Vec<String> = ids
            .as_array()
            .map(|a| a.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        ids.sort();

        let wanted: Vec<String> = match &self.library_id {
            Some(id) => vec![id.clone()],
            None => ids.clone(),
        };
        let mut details = Vec::with_capacity(wanted.len());
        for id in &wanted {
            let path = format!("{LIBRARY_PATH}/{id}");
            let lib = observe(|| rest.get(&path)).await?;
            details.push(library_row(&lib));
        }
        Ok(OpResult::unchanged()
            .with_data("content_libs", ids)
            .with_data("content_lib_details", details))
    }
}

// ── content_library_item_download ───────────────────────────────────

fn default_prepare_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
pub struct ContentLibraryItemDownload {
    pub library_name: String,
    pub item_name: String,
    /// Local directory; created when missing.
    #[serde(alias = "download_dir", alias = "dest")]
    pub dest_dir: PathBuf,
    /// Per-file bound on the wait for `PREPARED`, in seconds.
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteFile {
    name: String,
    #[serde(default)]
    size: u64,
}

/// Where a remote file lands under `dest`. Only a plain file name is accepted,
/// so a listing can never write outside the destination directory.
fn local_path(dest: &Path, name: &str) -> VsResult<PathBuf> {
    let mut parts = Path::new(name).components();
    match (parts.next(), parts.next()) {
        (Some(Component::Normal(_)), None) => Ok(dest.join(name)),
        _ => Err(VsError::protocol(format!(
            "library item file name '{name}' is not a plain file name"
        ))),
    }
}

async fn local_size(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path).await.ok().map(|m| m.len())
}

#[async_trait]
impl Operation for ContentLibraryItemDownload {
    async fn run(self, ctx: &OpContext) -> VsResult<OpResult> {
        let inv = &ctx.inventory;
        let library = inv
            .require_by_name(InventoryKind::ContentLibrary, &self.library_name, None)
            .await?;
        let item = inv
            .require_by_name(InventoryKind::ContentLibraryItem, &self.item_name, Some(&library))
            .await?;
        let rest = ctx.rest();
        let files_path = format!("{LIBRARY_PATH}/item/{}/file", item.id);
        let listed = observe(|| rest.get(&files_path)).await?;
        let files: Vec<RemoteFile> = serde_json::from_value(listed)
            .map_err(|e| VsError::protocol(format!("item file list: {e}")))?;
        let files = files
            .into_iter()
            .map(|f| local_path(&self.dest_dir, &f.name).map(|path| (f, path)))
            .collect::<VsResult<Vec<_>>>()?;

        // A file counts as present when a local copy of the same size exists.
        let mut present = Vec::new();
        for (f, path) in &files {
            if local_size(path).await == Some(f.size) {
                present.push(f.name.clone());
            }
        }
        let mut observed = Map::new();
        observed.insert("files".into(), json!(present));
        let all: Vec<String> = files.iter().map(|(f, _)| f.name.clone()).collect();
        let changes = diff(&observed, &DesiredSpec::new().set("files", all, Comparator::Set));

        let mut rec = ctx.reconciler();
        let missing: Vec<(RemoteFile, PathBuf)> = files
            .iter()
            .filter(|(f, _)| !present.contains(&f.name))
            .cloned()
            .collect();
        let dest = self.dest_dir.clone();
        let timeout = Duration::from_secs(self.prepare_timeout);
        let item_id = item.id.clone();
        let api = rest.clone();
        let progress = rec.progress();
        rec.apply(&self.item_name, changes, |_| async move {
            tokio::fs::create_dir_all(&dest)
                .await
                .map_err(|e| VsError::transport(format!("create {}: {e}", dest.display())))?;
            download_files(api, &item_id, &missing, timeout, &progress).await
        })
        .await;

        let mut result = rec.finish();
        if !result.failed {
            let downloaded: BTreeMap<String, String> = files
                .iter()
                .map(|(f, path)| (f.name.clone(), path.display().to_string()))
                .collect();
            result.insert("downloaded_files", json!(downloaded));
        }
        Ok(result)
    }
}

/// One download session: every file is prepared and streamed; the session is
/// marked failed on error and deleted in every case.
async fn download_files(
    rest: Arc<dyn RestApi>,
    item_id: &str,
    files: &[(RemoteFile, PathBuf)],
    timeout: Duration,
    progress: &Progress,
) -> VsResult<()> {
    let created = rest
        .post(
            SESSION_PATH,
            json!({
                "library_item_id": item_id,
                "client_token": uuid::Uuid::new_v4().to_string(),
            }),
        )
        .await?;
    let session = created
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| VsError::protocol("download session id missing from response"))?;
    tracing::info!(session = %session, item = %item_id, files = files.len(), "download session created");

    let mut outcome = Ok(());
    for (file, target) in files {
        if let Err(e) = download_one(rest.as_ref(), &session, file, target, timeout).await {
            outcome = Err(e);
            break;
        }
        progress.step();
    }

    if let Err(e) = &outcome {
        let reason = json!({ "client_error_message": e.message });
        if let Err(fail_err) = rest
            .request(HttpMethod::Post, &format!("{SESSION_PATH}/{session}"), &[("action", "fail".into())], Some(reason))
            .await
        {
            tracing::warn!(session = %session, error = %fail_err, "could not mark download session failed");
        }
    }
    if let Err(e) = rest.delete(&format!("{SESSION_PATH}/{session}")).await {
        tracing::warn!(session = %session, error = %e, "could not delete download session");
    }
    outcome
}

async fn download_one(
    rest: &dyn RestApi,
    session: &str,
    file: &RemoteFile,
    target: &Path,
    timeout: Duration,
) -> VsResult<()> {
    let file_path = format!("{SESSION_PATH}/{session}/file");
    rest.request(
        HttpMethod::Post,
        &file_path,
        &[("action", "prepare".into())],
        Some(json!({ "file_name": file.name, "encryption_method": "NONE" })),
    )
    .await?;

    let started = Instant::now();
    let uri = loop {
        let status = rest
            .request(HttpMethod::Get, &file_path, &[("file_name", file.name.clone())], None)
            .await?;
        match str_at(&status, "status") {
            Some("PREPARED") => {
                break str_at(&status, "download_endpoint.uri")
                    .map(str::to_string)
                    .ok_or_else(|| {
                        VsError::protocol(format!("prepared file '{}' has no download endpoint", file.name))
                    })?;
            }
            Some("ERROR") => {
                let reason = str_at(&status, "error_message.default_message").unwrap_or("unknown error");
                return Err(VsError::server_fault(format!("preparing '{}' failed: {reason}", file.name)));
            }
            _ => {}
        }
        if started.elapsed() >= timeout {
            return Err(VsError::timed_out(format!(
                "file '{}' was not prepared within {}s",
                file.name,
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(PREPARE_POLL).await;
    };

    let bytes = rest.download(&uri, target).await?;
    tracing::debug!(file = %file.name, bytes, path = %target.display(), "file downloaded");
    if file.size != 0 && bytes != file.size {
        return Err(VsError::protocol(format!(
            "'{}' is {bytes} bytes, expected {}",
            file.name, file.size
        )));
    }
    Ok(())
}
