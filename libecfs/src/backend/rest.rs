//! eManage REST backend.
//!
//! Talks JSON over HTTPS to the ECFS management server.  A volume is a data
//! container plus an NFS export, both named after the volume; snapshots are
//! taken per data container.  Authentication is a cookie session obtained
//! from `POST api/sessions`, so a [`RestBackend`] is only ever created by
//! [`RestConnector::connect`] and owned by a
//! [`Session`](crate::session::Session).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{
    BackendError, BackendSnapshot, BackendVolume, Connector, DataContainer, Export, ExportAccess,
    SnapshotPage, SnapshotQuery, StorageBackend, UserMapping, VolumeSpec, export_path,
};

const DATA_CONTAINERS: &str = "api/data_containers";
const EXPORTS: &str = "api/exports";
const SNAPSHOTS: &str = "api/snapshots";
const SESSIONS: &str = "api/sessions";

/// Default permissions of a freshly created container root directory.
const DIR_PERMISSIONS: u32 = 0o777;

/// Connection parameters of the management server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL, e.g. `https://10.0.0.1`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification (self-signed management servers).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Logs into the management server on behalf of a [`Session`](crate::session::Session).
pub struct RestConnector {
    config: RestConfig,
}

impl RestConnector {
    pub fn new(config: RestConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for RestConnector {
    type Backend = RestBackend;

    async fn connect(&self) -> Result<Arc<RestBackend>, BackendError> {
        RestBackend::login(&self.config).await.map(Arc::new)
    }
}

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Quota {
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct DataContainerRecord {
    id: u64,
    name: String,
    #[serde(default)]
    hard_quota: Option<Quota>,
}

impl From<DataContainerRecord> for DataContainer {
    fn from(r: DataContainerRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            hard_quota_bytes: r.hard_quota.map(|q| q.bytes).unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExportRecord {
    id: u64,
    name: String,
    data_container_id: u64,
}

impl From<ExportRecord> for Export {
    fn from(r: ExportRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            data_container_id: r.data_container_id,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotRecord {
    id: u64,
    name: String,
    data_container_id: u64,
    #[serde(default)]
    created_at: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    size: u64,
}

impl SnapshotRecord {
    fn into_backend(self, source_volume: String) -> BackendSnapshot {
        BackendSnapshot {
            id: self.id.to_string(),
            name: self.name,
            source_volume,
            created_at: self.created_at,
            status: self.status,
            size_bytes: self.size,
        }
    }
}

/// Page number encoded in a continuation token.  Pages are 1-based.
fn parse_page_token(token: Option<&str>) -> Result<u32, BackendError> {
    match token {
        None => Ok(1),
        Some(t) => match t.parse::<u32>() {
            Ok(page) if page >= 1 => Ok(page),
            _ => Err(BackendError::InvalidToken(t.to_owned())),
        },
    }
}

fn user_mapping_wire(mapping: UserMapping) -> &'static str {
    match mapping {
        UserMapping::NoMapping => "remap_none",
        UserMapping::RemapRoot => "remap_root",
        UserMapping::RemapAll => "remap_all",
    }
}

fn access_wire(access: ExportAccess) -> &'static str {
    match access {
        ExportAccess::ReadWrite => "read_write",
        ExportAccess::ReadOnly => "read_only",
    }
}

// ---------------------------------------------------------------------------
// RestBackend
// ---------------------------------------------------------------------------

/// An authenticated eManage API client.
pub struct RestBackend {
    http: reqwest::Client,
    base: Url,
}

impl RestBackend {
    /// Log in and return a client carrying the session cookie.
    #[instrument(skip(config), fields(url = %config.url))]
    pub async fn login(config: &RestConfig) -> Result<Self, BackendError> {
        let mut raw = config.url.trim().to_owned();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .map_err(|e| BackendError::Unavailable(format!("invalid management url {raw}: {e}")))?;

        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let backend = Self { http, base };
        let response = backend
            .http
            .post(backend.url(SESSIONS)?)
            .json(&json!({
                "user": { "login": config.username, "password": config.password }
            }))
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        match response.status() {
            s if s.is_success() => {}
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(BackendError::Unauthenticated(format!(
                    "login as {} rejected",
                    config.username
                )));
            }
            s => {
                return Err(BackendError::Api {
                    operation: "login".into(),
                    status: s.as_u16(),
                    message: response.text().await.unwrap_or_default(),
                });
            }
        }

        info!(url = %backend.base, "logged into management server");
        Ok(backend)
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::Decode(format!("bad path {path}: {e}")))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<T, BackendError> {
        let operation = format!("{method} {path}");
        let mut request = self.http.request(method, self.url(path)?).query(query);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Unavailable(format!("{operation}: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(BackendError::Unauthenticated(format!("{operation}: session expired")));
        }
        if !status.is_success() {
            return Err(BackendError::Api {
                operation,
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::Decode(format!("{operation}: {e}")))
    }

    /// DELETE that treats "already gone" as success.
    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        match self
            .call::<serde_json::Value>(Method::DELETE, path, &[], None)
            .await
        {
            Ok(_) => Ok(()),
            Err(BackendError::Api { status: 404, .. }) => {
                debug!(%path, "already deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn data_containers(&self) -> Result<Vec<DataContainer>, BackendError> {
        let records: Vec<DataContainerRecord> =
            self.call(Method::GET, DATA_CONTAINERS, &[], None).await?;
        Ok(records.into_iter().map(DataContainer::from).collect())
    }

    async fn create_data_container(&self, spec: &VolumeSpec) -> Result<DataContainer, BackendError> {
        let record: DataContainerRecord = self
            .call(
                Method::POST,
                DATA_CONTAINERS,
                &[],
                Some(json!({
                    "name": spec.name,
                    "hard_quota": { "bytes": spec.capacity_bytes },
                    "soft_quota": { "bytes": spec.capacity_bytes },
                    "dir_uid": spec.uid,
                    "dir_gid": spec.gid,
                    "dir_permissions": DIR_PERMISSIONS,
                })),
            )
            .await?;
        info!(name = %spec.name, id = record.id, "data container created");
        Ok(record.into())
    }

    async fn create_export(
        &self,
        container: &DataContainer,
        spec: &VolumeSpec,
    ) -> Result<Export, BackendError> {
        let record: ExportRecord = self
            .call(
                Method::POST,
                EXPORTS,
                &[],
                Some(json!({
                    "name": spec.name,
                    "path": "/",
                    "data_container_id": container.id,
                    "user_mapping": user_mapping_wire(spec.user_mapping),
                    "uid": spec.uid,
                    "gid": spec.gid,
                    "access_permission": access_wire(spec.access),
                })),
            )
            .await?;
        info!(name = %spec.name, id = record.id, "export created");
        Ok(record.into())
    }

    async fn snapshots_named(&self, name: &str) -> Result<Vec<SnapshotRecord>, BackendError> {
        let records: Vec<SnapshotRecord> = self
            .call(Method::GET, SNAPSHOTS, &[("name", name.to_owned())], None)
            .await?;
        Ok(records.into_iter().filter(|r| r.name == name).collect())
    }
}

#[async_trait]
impl StorageBackend for RestBackend {
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    async fn ensure_volume(&self, spec: &VolumeSpec) -> Result<BackendVolume, BackendError> {
        // A previous attempt may have stopped between the two creations, so
        // each half is checked on its own.
        let container = match self.find_data_container(&spec.name).await? {
            Some(dc) => {
                debug!("data container already exists");
                dc
            }
            None => self.create_data_container(spec).await?,
        };
        if self.find_export(&container, &spec.name).await?.is_none() {
            self.create_export(&container, spec).await?;
        }

        let capacity_bytes = match container.hard_quota_bytes {
            0 => spec.capacity_bytes,
            quota => quota,
        };
        Ok(BackendVolume {
            name: spec.name.clone(),
            capacity_bytes,
            export_path: export_path(&spec.name),
        })
    }

    #[instrument(skip(self))]
    async fn ensure_volume_absent(&self, name: &str) -> Result<(), BackendError> {
        let Some(container) = self.find_data_container(name).await? else {
            debug!("data container already absent");
            return Ok(());
        };
        if let Some(export) = self.find_export(&container, name).await? {
            self.delete(&format!("{EXPORTS}/{}", export.id)).await?;
        }
        self.delete(&format!("{DATA_CONTAINERS}/{}", container.id))
            .await?;
        info!(%name, "volume deleted");
        Ok(())
    }

    #[instrument(skip(self, _parameters))]
    async fn create_snapshot(
        &self,
        name: &str,
        source_volume: &str,
        _parameters: &HashMap<String, String>,
    ) -> Result<BackendSnapshot, BackendError> {
        let container = self
            .find_data_container(source_volume)
            .await?
            .ok_or_else(|| BackendError::NotFound {
                kind: "volume",
                name: source_volume.to_owned(),
            })?;
        // Snapshot ids are bare names, so a name may belong to one container
        // only.
        if let Some(existing) = self.snapshots_named(name).await?.into_iter().next() {
            if existing.data_container_id != container.id {
                return Err(BackendError::Api {
                    operation: "create snapshot".into(),
                    status: StatusCode::CONFLICT.as_u16(),
                    message: format!("snapshot {name} exists for another volume"),
                });
            }
            debug!(id = existing.id, "snapshot already exists");
            return Ok(existing.into_backend(container.name));
        }
        let record: SnapshotRecord = self
            .call(
                Method::POST,
                SNAPSHOTS,
                &[],
                Some(json!({ "name": name, "data_container_id": container.id })),
            )
            .await?;
        info!(%name, id = record.id, "snapshot created");
        Ok(record.into_backend(container.name))
    }

    #[instrument(skip(self))]
    async fn ensure_snapshot_absent(&self, id: &str) -> Result<(), BackendError> {
        let mut records = self.snapshots_named(id).await?;
        if records.len() > 1 {
            let containers: Vec<u64> = records.iter().map(|r| r.data_container_id).collect();
            warn!(?containers, "snapshot name is ambiguous, refusing to delete");
            return Err(BackendError::Api {
                operation: "delete snapshot".into(),
                status: StatusCode::CONFLICT.as_u16(),
                message: format!("snapshot {id} exists on {} data containers", records.len()),
            });
        }
        match records.pop() {
            Some(record) => self.delete(&format!("{SNAPSHOTS}/{}", record.id)).await,
            None => {
                debug!("snapshot already absent");
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<SnapshotPage, BackendError> {
        let page = parse_page_token(query.starting_token.as_deref())?;
        let containers = self.data_containers().await?;

        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(id) = &query.snapshot_id {
            params.push(("name", id.clone()));
        }
        if let Some(volume) = &query.source_volume {
            match containers.iter().find(|dc| &dc.name == volume) {
                Some(dc) => params.push(("data_container_id", dc.id.to_string())),
                None => return Ok(SnapshotPage::default()),
            }
        }
        if query.max_entries > 0 || query.starting_token.is_some() {
            params.push(("page", page.to_string()));
        }
        if query.max_entries > 0 {
            params.push(("per_page", query.max_entries.to_string()));
        }

        let records: Vec<SnapshotRecord> = self.call(Method::GET, SNAPSHOTS, &params, None).await?;
        let full_page = query.max_entries > 0 && records.len() == query.max_entries as usize;

        let names: HashMap<u64, &str> = containers
            .iter()
            .map(|dc| (dc.id, dc.name.as_str()))
            .collect();
        let snapshots = records
            .into_iter()
            .map(|r| {
                let source = names
                    .get(&r.data_container_id)
                    .map(|n| (*n).to_owned())
                    .unwrap_or_default();
                r.into_backend(source)
            })
            .collect();

        Ok(SnapshotPage {
            snapshots,
            next_token: full_page.then(|| (page + 1).to_string()),
        })
    }

    async fn find_data_container(
        &self,
        name: &str,
    ) -> Result<Option<DataContainer>, BackendError> {
        Ok(self
            .data_containers()
            .await?
            .into_iter()
            .find(|dc| dc.name == name))
    }

    async fn find_export(
        &self,
        container: &DataContainer,
        name: &str,
    ) -> Result<Option<Export>, BackendError> {
        let records: Vec<ExportRecord> = self.call(Method::GET, EXPORTS, &[], None).await?;
        Ok(records
            .into_iter()
            .find(|e| e.data_container_id == container.id && e.name == name)
            .map(Export::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::controller::{ControllerConfig, ControllerServer, CsiController};
    use crate::error::CsiError;
    use crate::session::Session;
    use crate::types::VolumeId;

    type Route = dyn Fn(&str, &str) -> (u16, String) + Send + Sync;

    /// Management server double: answers each request from `route` and
    /// records `METHOD /path[?query]` lines.
    struct StubServer {
        url: String,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl StubServer {
        async fn start(route: impl Fn(&str, &str) -> (u16, String) + Send + Sync + 'static) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let url = format!("http://{}", listener.local_addr().unwrap());
            let log = Arc::new(Mutex::new(Vec::new()));
            let route: Arc<Route> = Arc::new(route);
            let requests = Arc::clone(&log);
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let route = Arc::clone(&route);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        let _ = answer(stream, route.as_ref(), &requests).await;
                    });
                }
            });
            Self { url, log }
        }

        fn config(&self) -> RestConfig {
            RestConfig {
                url: self.url.clone(),
                username: "admin".into(),
                password: "secret".into(),
                accept_invalid_certs: false,
            }
        }

        async fn backend(&self) -> RestBackend {
            RestBackend::login(&self.config()).await.unwrap()
        }

        fn requests(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn saw(&self, request: &str) -> bool {
            self.requests().iter().any(|r| r == request)
        }
    }

    async fn answer(
        mut stream: TcpStream,
        route: &Route,
        log: &Mutex<Vec<String>>,
    ) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        let method = request_line.next().unwrap_or_default();
        let target = request_line.next().unwrap_or_default();
        let path = target.split_once('?').map_or(target, |(path, _)| path);
        log.lock().unwrap().push(format!("{method} {target}"));

        let (status, body) = route(method, path);
        let response = format!(
            "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    fn ok(body: serde_json::Value) -> (u16, String) {
        (200, body.to_string())
    }

    fn unrouted() -> (u16, String) {
        (500, r#"{"error": "unexpected request"}"#.to_owned())
    }

    fn two_nightly_snapshots() -> serde_json::Value {
        json!([
            {"id": 1, "name": "nightly", "data_container_id": 7,
             "created_at": "2024-05-01T10:00:00Z", "status": "READY"},
            {"id": 2, "name": "nightly", "data_container_id": 8,
             "created_at": "2024-05-01T10:00:00Z", "status": "READY"},
        ])
    }

    fn spec(name: &str) -> VolumeSpec {
        VolumeSpec {
            name: name.into(),
            capacity_bytes: 4096,
            user_mapping: UserMapping::RemapAll,
            uid: 0,
            gid: 0,
            access: ExportAccess::ReadWrite,
        }
    }

    #[test]
    fn page_tokens() {
        assert_eq!(parse_page_token(None), Ok(1));
        assert_eq!(parse_page_token(Some("3")), Ok(3));
        assert!(matches!(
            parse_page_token(Some("0")),
            Err(BackendError::InvalidToken(_))
        ));
        assert!(matches!(
            parse_page_token(Some("abc")),
            Err(BackendError::InvalidToken(_))
        ));
    }

    #[test]
    fn data_container_record_decoding() {
        let json = r#"{"id": 7, "name": "pvc-1", "hard_quota": {"bytes": 1024}, "extra": true}"#;
        let record: DataContainerRecord = serde_json::from_str(json).unwrap();
        let dc = DataContainer::from(record);
        assert_eq!(dc.id, 7);
        assert_eq!(dc.hard_quota_bytes, 1024);
    }

    #[test]
    fn snapshot_record_keeps_raw_fields() {
        let json = r#"{"id": 3, "name": "s1", "data_container_id": 7,
                       "created_at": "2024-05-01T10:00:00Z", "status": "PENDING"}"#;
        let record: SnapshotRecord = serde_json::from_str(json).unwrap();
        let snap = record.into_backend("pvc-1".into());
        assert_eq!(snap.id, "3");
        assert_eq!(snap.status, "PENDING");
        assert_eq!(snap.size_bytes, 0);
        assert_eq!(snap.source_volume, "pvc-1");
    }

    #[tokio::test]
    async fn login_to_closed_port_is_unavailable() {
        let config = RestConfig {
            url: "http://127.0.0.1:1".into(),
            username: "admin".into(),
            password: "secret".into(),
            accept_invalid_certs: false,
        };
        let err = RestBackend::login(&config).await.err().expect("login must fail");
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn login_rejects_malformed_url() {
        let config = RestConfig {
            url: "not a url".into(),
            ..Default::default()
        };
        let err = RestBackend::login(&config).await.err().expect("login must fail");
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn delete_volume_tolerates_already_deleted_export() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => ok(json!([{"id": 7, "name": "pvc-1"}])),
            ("GET", "/api/exports") => {
                ok(json!([{"id": 3, "name": "pvc-1", "data_container_id": 7}]))
            }
            ("DELETE", "/api/exports/3") => (404, r#"{"error": "not found"}"#.to_owned()),
            ("DELETE", "/api/data_containers/7") => ok(json!({})),
            _ => unrouted(),
        })
        .await;

        server.backend().await.ensure_volume_absent("pvc-1").await.unwrap();
        assert!(server.saw("DELETE /api/exports/3"));
        assert!(server.saw("DELETE /api/data_containers/7"));
    }

    #[tokio::test]
    async fn delete_of_missing_volume_touches_nothing() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => ok(json!([])),
            _ => unrouted(),
        })
        .await;

        server.backend().await.ensure_volume_absent("pvc-1").await.unwrap();
        assert_eq!(
            server.requests(),
            vec!["POST /api/sessions", "GET /api/data_containers"]
        );
    }

    #[tokio::test]
    async fn half_created_volume_gets_its_export() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => ok(json!([
                {"id": 7, "name": "pvc-1", "hard_quota": {"bytes": 2048}}
            ])),
            ("GET", "/api/exports") => ok(json!([])),
            ("POST", "/api/exports") => {
                ok(json!({"id": 9, "name": "pvc-1", "data_container_id": 7}))
            }
            _ => unrouted(),
        })
        .await;

        let volume = server.backend().await.ensure_volume(&spec("pvc-1")).await.unwrap();
        assert_eq!(volume.capacity_bytes, 2048);
        assert_eq!(volume.export_path, "/pvc-1/pvc-1");
        assert!(server.saw("POST /api/exports"));
        assert!(!server.saw("POST /api/data_containers"));
    }

    #[tokio::test]
    async fn expired_session_is_dropped() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => (401, r#"{"error": "expired"}"#.to_owned()),
            _ => unrouted(),
        })
        .await;

        let err = server
            .backend()
            .await
            .find_data_container("pvc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unauthenticated(_)));
        assert!(err.is_session_expired());

        let session = Arc::new(Session::new(RestConnector::new(server.config())));
        let controller = ControllerServer::new(Arc::clone(&session), ControllerConfig::default());
        let volume = VolumeId("pvc-1".into());
        let err = controller.delete_volume(&volume).await.unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)), "{err}");
        assert!(!session.is_established().await);

        controller.delete_volume(&volume).await.unwrap_err();
        let logins = server
            .requests()
            .iter()
            .filter(|r| *r == "POST /api/sessions")
            .count();
        assert_eq!(logins, 3);
    }

    #[tokio::test]
    async fn list_pages_through_tokens() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => ok(json!([{"id": 7, "name": "pvc-1"}])),
            ("GET", "/api/snapshots") => ok(json!([
                {"id": 3, "name": "a", "data_container_id": 7},
                {"id": 4, "name": "b", "data_container_id": 7},
            ])),
            _ => unrouted(),
        })
        .await;
        let backend = server.backend().await;

        let page = backend
            .list_snapshots(&SnapshotQuery {
                max_entries: 2,
                starting_token: Some("2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(server.saw("GET /api/snapshots?page=2&per_page=2"));
        assert_eq!(page.next_token.as_deref(), Some("3"));
        assert_eq!(page.snapshots[0].source_volume, "pvc-1");

        // A token without a page size still resumes where it left off.
        let page = backend
            .list_snapshots(&SnapshotQuery {
                starting_token: Some("2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(server.saw("GET /api/snapshots?page=2"));
        assert_eq!(page.next_token, None);
    }

    #[tokio::test]
    async fn snapshot_name_is_not_shared_between_volumes() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/data_containers") => ok(json!([
                {"id": 7, "name": "pvc-1"},
                {"id": 8, "name": "pvc-2"},
            ])),
            ("GET", "/api/snapshots") => ok(json!([
                {"id": 1, "name": "nightly", "data_container_id": 7, "status": "READY"}
            ])),
            _ => unrouted(),
        })
        .await;
        let backend = server.backend().await;

        let err = backend
            .create_snapshot("nightly", "pvc-2", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Api { status: 409, .. }), "{err}");

        let existing = backend
            .create_snapshot("nightly", "pvc-1", &HashMap::new())
            .await
            .unwrap();
        assert_eq!(existing.id, "1");
        assert!(!server.saw("POST /api/snapshots"));
    }

    #[tokio::test]
    async fn ambiguous_snapshot_name_is_never_deleted() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/snapshots") => ok(two_nightly_snapshots()),
            _ => unrouted(),
        })
        .await;

        let err = server
            .backend()
            .await
            .ensure_snapshot_absent("nightly")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Api { status: 409, .. }), "{err}");
        assert!(!server.requests().iter().any(|r| r.starts_with("DELETE")));
    }

    #[tokio::test]
    async fn delete_snapshot_removes_only_its_record() {
        let server = StubServer::start(|method, path| match (method, path) {
            ("POST", "/api/sessions") => ok(json!({})),
            ("GET", "/api/snapshots") => ok(json!([
                {"id": 1, "name": "nightly", "data_container_id": 7},
                {"id": 5, "name": "nightly-old", "data_container_id": 8},
            ])),
            ("DELETE", "/api/snapshots/1") => ok(json!({})),
            _ => unrouted(),
        })
        .await;

        server.backend().await.ensure_snapshot_absent("nightly").await.unwrap();
        let deletes: Vec<String> = server
            .requests()
            .into_iter()
            .filter(|r| r.starts_with("DELETE"))
            .collect();
        assert_eq!(deletes, vec!["DELETE /api/snapshots/1"]);
    }
}
