//! Upload pipeline
//!
//! 1. Resolve the destination folder (custom path or `files/<scene>/<yyyymmdd>/<hh>/<mm>`)
//! 2. Resolve the file name, probing `0_<name>`, `1_<name>`, ... on collision
//! 3. With a claimed hash, an existing file at the base name must hash to it
//! 4. Stream the body to disk and hash it
//! 5. Drop the new copy if the hash is already stored (global dedup)
//! 6. Commit the record and queue it for the peers
//!
//! Retrying an upload with the same content ends at step 5.

use crate::config::FILES_DIR;
use crate::digest::md5_hex;
use crate::error::StorageError;
use crate::queue::ReplicationQueues;
use crate::record::FileRecord;
use crate::registry::Registrar;
use chrono::{DateTime, Local};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Parameters of one upload
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Name given by the client
    pub file_name: String,
    /// Hash the client says the content has
    pub claimed_hash: Option<String>,
    /// Target scene; the configured default when None
    pub scene: Option<String>,
    /// Folder below `files/`, honoured when custom paths are enabled
    pub custom_path: Option<String>,
}

/// Result of an upload
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: FileRecord,
    /// True when identical content was already stored and this copy was dropped
    pub deduplicated: bool,
}

pub struct UploadPipeline {
    registrar: Arc<Registrar>,
    queues: ReplicationQueues,
}

/// Where the bytes ended up after step 2-4
struct Placed {
    name: String,
    rename: String,
    /// Written by this upload (as opposed to an identical pre-existing file)
    written: bool,
    size: u64,
    hash: String,
}

impl UploadPipeline {
    pub fn new(registrar: Arc<Registrar>, queues: ReplicationQueues) -> Self {
        Self { registrar, queues }
    }

    /// Store an upload read from `body`
    pub async fn store<R>(
        &self,
        request: UploadRequest,
        body: R,
    ) -> Result<UploadOutcome, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let config = self.registrar.config();
        let now = Local::now();

        let file_name = sanitize_file_name(&request.file_name)?;
        let scene = match request.scene.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => config.default_scene.clone(),
        };
        if !config.scenes.is_empty() && !config.scenes.contains(&scene) {
            return Err(StorageError::InvalidRequest(format!("invalid scene: {}", scene)));
        }

        let custom_path = if config.enable_custom_path {
            request.custom_path.as_deref()
        } else {
            None
        };
        let folder = resolve_folder(&scene, custom_path, &now)?;
        let folder_path = self.registrar.resolve(&folder);
        fs::create_dir_all(&folder_path).await?;

        let placed = self
            .place(&folder, &folder_path, &file_name, request.claimed_hash.as_deref(), body)
            .await?;

        let record = FileRecord {
            hash: placed.hash.clone(),
            name: placed.name,
            rename: placed.rename,
            path: folder,
            size: placed.size,
            scene,
            timestamp: now.timestamp(),
            peers: vec![self.registrar.host().to_string()],
        };

        if let Some(existing) = self.registrar.lookup(&record.hash).await? {
            if existing.full_path() != record.full_path() && placed.written {
                fs::remove_file(self.registrar.local_path(&record)).await?;
            }
            debug!(hash = %existing.hash, path = %existing.full_path(), "Upload deduplicated");
            return Ok(UploadOutcome {
                record: existing,
                deduplicated: true,
            });
        }

        self.registrar.commit(&record).await?;
        if !config.peers.is_empty() {
            self.queues.enqueue_push(record.clone()).await?;
        }

        info!(
            hash = %record.hash,
            size = record.size,
            path = %record.full_path(),
            "Stored upload"
        );
        Ok(UploadOutcome {
            record,
            deduplicated: false,
        })
    }

    /// Steps 2-4: pick a name, check or write the bytes, hash them
    async fn place<R>(
        &self,
        folder: &str,
        folder_path: &Path,
        file_name: &str,
        claimed_hash: Option<&str>,
        mut body: R,
    ) -> Result<Placed, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let config = self.registrar.config();
        let algorithm = config.hash_algorithm;
        let limit = config.name_probe_limit.max(1);

        let rename = if config.rename_file {
            format!("{}{}", md5_hex(&uuid::Uuid::new_v4().to_string()), extension(file_name))
        } else {
            String::new()
        };
        let base = if rename.is_empty() { file_name } else { rename.as_str() };

        for attempt in 0..limit {
            let candidate = if attempt == 0 {
                base.to_string()
            } else {
                format!("{}_{}", attempt - 1, base)
            };
            let path = folder_path.join(&candidate);

            let file = match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if attempt == 0 {
                        if let Some(expected) = claimed_hash {
                            return self.adopt_existing(&path, &candidate, file_name, &rename, expected).await;
                        }
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let size = match write_body(file, &mut body).await {
                Ok(size) => size,
                Err(e) => {
                    remove_quietly(&path).await;
                    return Err(e);
                }
            };

            let hash = algorithm.hash_file(&path).await?;
            if let Some(expected) = claimed_hash {
                if !expected.eq_ignore_ascii_case(&hash) {
                    remove_quietly(&path).await;
                    return Err(StorageError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual: hash,
                    });
                }
            }

            let (name, rename) = if rename.is_empty() {
                (candidate, String::new())
            } else {
                (file_name.to_string(), candidate)
            };
            return Ok(Placed {
                name,
                rename,
                written: true,
                size,
                hash,
            });
        }

        Err(StorageError::NameExhausted {
            folder: folder.to_string(),
            name: base.to_string(),
            limit,
        })
    }

    /// Step 3: a file already sits at the base name and the client named a hash
    async fn adopt_existing(
        &self,
        path: &Path,
        candidate: &str,
        file_name: &str,
        rename: &str,
        expected: &str,
    ) -> Result<Placed, StorageError> {
        let algorithm = self.registrar.config().hash_algorithm;
        let actual = algorithm.hash_file(path).await?;
        if !expected.eq_ignore_ascii_case(&actual) {
            warn!(path = %path.display(), expected = %expected, actual = %actual, "Refusing to overwrite different content");
            return Err(StorageError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        let size = fs::metadata(path).await?.len();
        let (name, rename) = if rename.is_empty() {
            (candidate.to_string(), String::new())
        } else {
            (file_name.to_string(), candidate.to_string())
        };
        Ok(Placed {
            name,
            rename,
            written: false,
            size,
            hash: actual,
        })
    }
}

async fn write_body<R>(mut file: fs::File, body: &mut R) -> Result<u64, StorageError>
where
    R: AsyncRead + Unpin,
{
    let size = tokio::io::copy(body, &mut file).await?;
    file.flush().await?;
    Ok(size)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "Failed to remove partial upload");
    }
}

/// Last path component of a client-supplied name
fn sanitize_file_name(name: &str) -> Result<String, StorageError> {
    let name = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(StorageError::InvalidRequest("missing file name".to_string()));
    }
    Ok(name.to_string())
}

/// `.ext` of a file name, or empty
fn extension(name: &str) -> &str {
    match name.rfind('.') {
        Some(i) if i > 0 => &name[i..],
        _ => "",
    }
}

/// Relative folder for an upload
fn resolve_folder(
    scene: &str,
    custom_path: Option<&str>,
    now: &DateTime<Local>,
) -> Result<String, StorageError> {
    if let Some(custom) = custom_path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
        if custom.split('/').any(|part| part == ".." || part == ".") {
            return Err(StorageError::InvalidRequest(format!("invalid path: {}", custom)));
        }
        if custom == FILES_DIR || custom.starts_with(&format!("{}/", FILES_DIR)) {
            return Ok(custom.to_string());
        }
        return Ok(format!("{}/{}", FILES_DIR, custom));
    }
    Ok(format!("{}/{}/{}", FILES_DIR, scene, now.format("%Y%m%d/%H/%M")))
}
