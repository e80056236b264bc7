//! HTTP surface of a node
//!
//! ## Client API
//! - `POST /upload` - multipart upload (`file`, optional `scene`, `path`, `md5`, `output=json`)
//! - `POST /check_file_exist` - record for `md5` (hash or path alias), empty record if absent
//! - `GET /<group>/<path>` - download a committed file
//! - `GET /stat` - per-day counters
//! - `GET /status` - health blob
//! - `GET /repair_stat` - rebuild counters from the ledgers
//!
//! ## Peer API (callers must be this node, loopback, or a configured peer)
//! - `POST /delete` - remove the file behind `md5`
//! - `POST /syncfile` - multipart push of file bytes plus record fields
//! - `POST /syncfile_info` - push of a record only (`fileInfo` JSON)
//! - `POST /get_md5s_by_date` - comma-joined committed hashes of `date`
//! - `POST /receive_md5s` - `md5s` the caller holds and we lack, optional `peer`
//! - `GET /sync` - replay a day's ledgers (`date`, `force`)
//! - `GET /repair` - start a repair sweep (`force`)
//!
//! Parameters are read from the query string and, for url-encoded POSTs,
//! from the body; body values win. Multipart metadata fields must precede
//! the file part.
//!
//! ```bash
//! curl -F file=@report.pdf -F scene=docs -F output=json http://localhost:8080/upload
//! curl http://localhost:8080/group1/docs/20261016/10/30/report.pdf
//! ```

use crate::config::{peer_ip, FILES_DIR};
use crate::digest::verify_token;
use crate::error::StorageError;
use crate::ledger::today;
use crate::node::Node;
use crate::record::{FileRecord, UploadResult};
use crate::upload::UploadRequest;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Component;
use std::sync::Arc;
use tokio::fs;
use tokio::net::TcpListener;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

/// Largest url-encoded form accepted (a day's hash list fits comfortably)
const MAX_FORM_BYTES: usize = 64 * 1024 * 1024;

type ResponseBody = UnsyncBoxBody<Bytes, std::io::Error>;

#[derive(Deserialize)]
struct HashParams {
    md5: String,
}

#[derive(Deserialize)]
struct DateParams {
    date: String,
}

#[derive(Deserialize)]
struct SyncParams {
    date: Option<String>,
    force: Option<String>,
}

#[derive(Deserialize)]
struct RepairParams {
    force: Option<String>,
}

#[derive(Deserialize)]
struct ReceiveParams {
    md5s: String,
    peer: Option<String>,
}

#[derive(Deserialize)]
struct SyncInfoParams {
    #[serde(rename = "fileInfo")]
    file_info: String,
}

#[derive(Deserialize, Default)]
struct DownloadParams {
    token: Option<String>,
    timestamp: Option<String>,
    download: Option<String>,
}

/// HTTP server state
pub struct HttpServer {
    node: Arc<Node>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(node: Arc<Node>, bind_addr: SocketAddr) -> Self {
        Self { node, bind_addr }
    }

    /// Bind `bind_addr` and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<(), StorageError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), StorageError> {
        info!(addr = %listener.local_addr()?, "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req, remote_addr).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(
        &self,
        req: Request<Incoming>,
        remote_addr: SocketAddr,
    ) -> Result<Response<ResponseBody>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        let client = client_ip(remote_addr, req.headers());
        let is_peer = self.is_peer(client);

        debug!(method = %method, path = %path, client = %client, "Incoming request");

        let group_prefix = format!("/{}/", self.node.config().group);
        let result = match (method, path.as_str()) {
            (_, "/check_file_exist") => self.handle_check_file_exist(req).await,
            (Method::POST, "/upload") => self.handle_upload(req).await,
            (_, "/upload") => Ok(text(StatusCode::METHOD_NOT_ALLOWED, "use a multipart POST")),
            (_, "/stat") => json(&self.node.day_stats().await),
            (_, "/status") => json(&self.node.status().await),
            (_, "/repair_stat") => match self.node.repair_stat().await {
                Ok(rows) => json(&rows),
                Err(e) => Err(e),
            },

            (_, "/delete") if is_peer => self.handle_delete(req).await,
            (_, "/syncfile") if is_peer => self.handle_sync_file(req).await,
            (_, "/syncfile_info") if is_peer => self.handle_sync_file_info(req).await,
            (_, "/get_md5s_by_date") if is_peer => self.handle_hash_set(req).await,
            (_, "/receive_md5s") if is_peer => self.handle_receive_md5s(req).await,
            (_, "/sync") if is_peer => self.handle_sync(req).await,
            (_, "/repair") if is_peer => self.handle_repair(req).await,
            (
                _,
                "/delete" | "/syncfile" | "/syncfile_info" | "/get_md5s_by_date" | "/receive_md5s"
                | "/sync" | "/repair",
            ) => Err(StorageError::Forbidden(format!(
                "only cluster peers may call this, current ip: {}",
                client
            ))),

            (Method::GET | Method::HEAD, p) if p.starts_with(&group_prefix) => {
                self.handle_download(req, is_peer).await
            }

            _ => Ok(text(StatusCode::NOT_FOUND, "Not Found")),
        };

        match result {
            Ok(response) => Ok(response),
            Err(e) => {
                let status = error_status(&e);
                if status.is_server_error() {
                    error!(path = %path, error = %e, "Request error");
                } else {
                    debug!(path = %path, error = %e, "Request rejected");
                }
                Ok(text(status, e.to_string()))
            }
        }
    }

    /// Loopback, this node, or a configured peer
    fn is_peer(&self, ip: IpAddr) -> bool {
        let config = self.node.config();
        ip.is_loopback()
            || peer_ip(&config.host) == Some(ip)
            || config.peers.iter().any(|p| peer_ip(p) == Some(ip))
    }

    async fn handle_check_file_exist(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: HashParams = form_params(req).await?;
        json(&self.node.check_file_exist(&params.md5).await?)
    }

    /// POST /upload
    async fn handle_upload(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let (mut fields, mut multipart) = open_multipart(req)?;

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if field.file_name().is_none() && name != "file" {
                fields.insert(name, field.text().await?);
                continue;
            }

            let file_name = fields
                .get("filename")
                .cloned()
                .or_else(|| field.file_name().map(str::to_string))
                .unwrap_or_default();
            let request = UploadRequest {
                file_name,
                claimed_hash: fields.get("md5").filter(|h| !h.is_empty()).cloned(),
                scene: fields.get("scene").cloned(),
                custom_path: fields.get("path").cloned(),
            };
            let outcome = self.node.upload(request, field_reader(field)).await?;

            let registrar = self.node.registrar();
            let record = &outcome.record;
            let url = registrar.download_url(record);
            if fields.get("output").map(String::as_str) == Some("json") {
                return json(&UploadResult {
                    url,
                    md5: record.hash.clone(),
                    path: registrar.download_path(record),
                    domain: registrar.download_domain(),
                    scene: record.scene.clone(),
                });
            }
            return Ok(text(StatusCode::OK, url));
        }

        Err(StorageError::InvalidRequest("missing file part".to_string()))
    }

    /// POST /delete
    async fn handle_delete(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: HashParams = form_params(req).await?;
        self.node.delete(&params.md5).await?;
        Ok(text(StatusCode::OK, "remove success"))
    }

    /// POST /syncfile
    async fn handle_sync_file(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let (mut fields, mut multipart) = open_multipart(req)?;

        while let Some(field) = multipart.next_field().await? {
            let name = field.name().unwrap_or_default().to_string();
            if field.file_name().is_none() && name != "file" {
                fields.insert(name, field.text().await?);
                continue;
            }

            let record = record_from_fields(&fields)?;
            let stored = self.node.receive_file(record, field_reader(field)).await?;
            return Ok(text(StatusCode::OK, self.node.registrar().download_url(&stored)));
        }

        Err(StorageError::InvalidRequest("missing file part".to_string()))
    }

    /// POST /syncfile_info
    async fn handle_sync_file_info(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: SyncInfoParams = form_params(req).await?;
        let record: FileRecord = serde_json::from_str(&params.file_info)
            .map_err(|e| StorageError::InvalidRequest(format!("fileInfo: {}", e)))?;
        let url = self.node.receive_reference(record).await?;
        Ok(text(StatusCode::OK, url))
    }

    /// POST /get_md5s_by_date
    async fn handle_hash_set(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: DateParams = form_params(req).await?;
        let date = checked_date(&params.date)?;
        let mut hashes: Vec<String> = self.node.hash_set(&date).await?.into_iter().collect();
        hashes.sort();
        Ok(text(StatusCode::OK, hashes.join(",")))
    }

    /// POST /receive_md5s
    async fn handle_receive_md5s(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: ReceiveParams = form_params(req).await?;
        let hashes: Vec<String> = params
            .md5s
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(str::to_string)
            .collect();
        let origin = params.peer.filter(|p| !p.is_empty());
        self.node.receive_missing(origin, hashes);
        Ok(text(StatusCode::OK, ""))
    }

    /// GET /sync
    async fn handle_sync(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: SyncParams = form_params(req).await?;
        let date = match params.date.filter(|d| !d.is_empty()) {
            Some(d) => checked_date(&d)?,
            None => today(),
        };
        self.node.sync(date, is_set(params.force.as_deref()));
        Ok(text(StatusCode::OK, "job is running"))
    }

    /// GET /repair
    async fn handle_repair(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let params: RepairParams = form_params(req).await?;
        if self.node.spawn_repair(is_set(params.force.as_deref())) {
            Ok(text(StatusCode::OK, "repair job start..."))
        } else {
            Ok(text(StatusCode::OK, "repair job already running"))
        }
    }

    /// GET /<group>/<path>
    async fn handle_download(
        &self,
        req: Request<Incoming>,
        is_peer: bool,
    ) -> Result<Response<ResponseBody>, StorageError> {
        let config = self.node.config();
        let registrar = self.node.registrar();
        let uri = req.uri().clone();
        let params: DownloadParams = match uri.query() {
            Some(q) => serde_urlencoded::from_str(q)?,
            None => DownloadParams::default(),
        };

        let below = &uri.path()[config.group.len() + 2..];
        let below = urlencoding::decode(below)
            .map_err(|_| StorageError::InvalidRequest("bad path encoding".to_string()))?;
        let below = below.trim_end_matches('/');
        let full_path = if below.is_empty() {
            FILES_DIR.to_string()
        } else {
            format!("{}/{}", FILES_DIR, below)
        };
        if std::path::Path::new(&full_path)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidRequest("invalid path".to_string()));
        }
        let local = registrar.resolve(&full_path);

        let token_check = config.download_use_token && !is_peer;
        if token_check {
            let (Some(token), Some(timestamp)) = (&params.token, &params.timestamp) else {
                return Err(StorageError::Forbidden("invalid request".to_string()));
            };
            let hash = match registrar.metadata().get_by_path(&full_path)? {
                Some(record) => Some(record.hash),
                None if fs::metadata(&local).await.map(|m| m.is_file()).unwrap_or(false) => {
                    Some(config.hash_algorithm.hash_file(&local).await?)
                }
                None => None,
            };
            if let Some(hash) = hash {
                verify_token(
                    token,
                    &hash,
                    timestamp,
                    chrono::Utc::now().timestamp(),
                    config.download_token_expire_secs,
                )?;
            }
        }

        let meta = match fs::metadata(&local).await {
            Ok(meta) => meta,
            Err(_) => {
                if let Some(peer) = self.node.locate_remote(&full_path).await {
                    let target = uri
                        .path_and_query()
                        .map(|pq| pq.as_str())
                        .unwrap_or(uri.path());
                    return redirect(&format!("{}{}", peer, target));
                }
                return Ok(text(StatusCode::NOT_FOUND, "Not Found"));
            }
        };

        if meta.is_dir() {
            if !config.show_dir {
                return Err(StorageError::Forbidden("list dir deny".to_string()));
            }
            return list_dir(&local).await;
        }

        info!(path = %full_path, size = meta.len(), "Serving download");
        let mut response = if req.method() == Method::HEAD {
            Response::new(full(Bytes::new()))
        } else {
            let file = fs::File::open(&local).await?;
            let stream = ReaderStream::new(file).map_ok(Frame::data);
            Response::new(StreamBody::new(stream).boxed_unsync())
        };
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(meta.len()));
        if is_set(params.download.as_deref()) {
            let name = full_path.rsplit('/').next().unwrap_or_default();
            if let Ok(value) =
                HeaderValue::from_str(&format!("attachment; filename=\"{}\"", name.replace('"', "")))
            {
                headers.insert(header::CONTENT_DISPOSITION, value);
            }
        }
        Ok(response)
    }
}

/// `X-Forwarded-For`, then `X-Real-Ip`, then the socket address
fn client_ip(remote_addr: SocketAddr, headers: &HeaderMap) -> IpAddr {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    };
    forwarded.or_else(real).unwrap_or(remote_addr.ip())
}

fn is_set(flag: Option<&str>) -> bool {
    matches!(flag, Some("1") | Some("true"))
}

fn checked_date(date: &str) -> Result<String, StorageError> {
    if crate::ledger::is_date(date) {
        Ok(date.to_string())
    } else {
        Err(StorageError::InvalidRequest(format!("invalid date: {}", date)))
    }
}

/// Decode query plus url-encoded body into `T`; body values win
async fn form_params<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, StorageError> {
    let query = req.uri().query().unwrap_or("").to_string();
    let is_form = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/x-www-form-urlencoded"))
        .unwrap_or(false);

    let mut pairs: Vec<(String, String)> =
        form_urlencoded::parse(query.as_bytes()).into_owned().collect();
    if is_form {
        let body = Limited::new(req.into_body(), MAX_FORM_BYTES)
            .collect()
            .await
            .map_err(|e| StorageError::InvalidRequest(format!("body: {}", e)))?
            .to_bytes();
        for (key, value) in form_urlencoded::parse(&body).into_owned() {
            pairs.retain(|(k, _)| k != &key);
            pairs.push((key, value));
        }
    }

    let encoded = serde_urlencoded::to_string(&pairs)
        .map_err(|e| StorageError::InvalidRequest(e.to_string()))?;
    Ok(serde_urlencoded::from_str(&encoded)?)
}

/// Query fields plus a multipart reader over the body
fn open_multipart(
    req: Request<Incoming>,
) -> Result<(HashMap<String, String>, multer::Multipart<'static>), StorageError> {
    let boundary = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| multer::parse_boundary(v).ok())
        .ok_or_else(|| StorageError::InvalidRequest("expected multipart/form-data".to_string()))?;
    let fields: HashMap<String, String> = form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
        .into_owned()
        .collect();
    let stream = req.into_body().into_data_stream();
    Ok((fields, multer::Multipart::new(stream, boundary)))
}

/// A multipart file part as an `AsyncRead`
fn field_reader(field: multer::Field<'static>) -> impl tokio::io::AsyncRead + Unpin {
    StreamReader::new(Box::pin(field.map_err(std::io::Error::other)))
}

/// Record described by the text fields of a `/syncfile` push
fn record_from_fields(fields: &HashMap<String, String>) -> Result<FileRecord, StorageError> {
    let required = |key: &str| {
        fields
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| StorageError::InvalidRequest(format!("missing field: {}", key)))
    };
    let number = |key: &str| -> Result<i64, StorageError> {
        required(key)?
            .parse()
            .map_err(|_| StorageError::InvalidRequest(format!("invalid field: {}", key)))
    };
    Ok(FileRecord {
        hash: required("md5")?,
        name: required("name")?,
        rename: fields.get("rename").cloned().unwrap_or_default(),
        path: required("path")?,
        size: number("size")?.max(0) as u64,
        scene: fields.get("scene").cloned().unwrap_or_default(),
        timestamp: number("timestamp")?,
        peers: fields
            .get("peers")
            .map(|p| {
                p.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

async fn list_dir(dir: &std::path::Path) -> Result<Response<ResponseBody>, StorageError> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    Ok(text(StatusCode::OK, names.join("\n")))
}

fn full(body: impl Into<Bytes>) -> ResponseBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed_unsync()
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ResponseBody> {
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn json<T: Serialize>(value: &T) -> Result<Response<ResponseBody>, StorageError> {
    let mut response = Response::new(full(serde_json::to_vec(value)?));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    Ok(response)
}

fn redirect(location: &str) -> Result<Response<ResponseBody>, StorageError> {
    let value = HeaderValue::from_str(location)
        .map_err(|e| StorageError::Internal(format!("redirect target: {}", e)))?;
    let mut response = text(StatusCode::FOUND, "");
    response.headers_mut().insert(header::LOCATION, value);
    Ok(response)
}

fn error_status(e: &StorageError) -> StatusCode {
    match e {
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        StorageError::ChecksumMismatch { .. }
        | StorageError::NameExhausted { .. }
        | StorageError::InvalidRequest(_)
        | StorageError::Multipart(_) => StatusCode::BAD_REQUEST,
        StorageError::Forbidden(_) => StatusCode::FORBIDDEN,
        StorageError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ip_prefers_forwarded_headers() {
        let remote: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_ip(remote, &headers), remote.ip());

        headers.insert("x-real-ip", HeaderValue::from_static("192.0.2.8"));
        assert_eq!(client_ip(remote, &headers).to_string(), "192.0.2.8");

        headers.insert("x-forwarded-for", HeaderValue::from_static("192.0.2.9, 10.0.0.1"));
        assert_eq!(client_ip(remote, &headers).to_string(), "192.0.2.9");
    }

    #[test]
    fn test_record_from_fields() {
        let mut fields: HashMap<String, String> = [
            ("md5", "abc"),
            ("name", "report.pdf"),
            ("path", "files/docs/20261016/10/30"),
            ("size", "17"),
            ("timestamp", "1792130000"),
            ("peers", "http://10.0.0.1:8080"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let record = record_from_fields(&fields).unwrap();
        assert_eq!(record.size, 17);
        assert_eq!(record.peers, vec!["http://10.0.0.1:8080"]);

        fields.remove("md5");
        assert!(record_from_fields(&fields).is_err());
    }

    #[test]
    fn test_error_status() {
        assert_eq!(
            error_status(&StorageError::NotFound("x".to_string())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&StorageError::ChecksumMismatch {
                expected: "a".to_string(),
                actual: "b".to_string()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_status(&StorageError::Forbidden("x".to_string())),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_flags_and_dates() {
        assert!(is_set(Some("1")));
        assert!(!is_set(Some("0")));
        assert!(!is_set(None));
        assert!(checked_date("20261016").is_ok());
        assert!(checked_date("../x").is_err());
    }
}
