use std::{io::ErrorKind, sync::Arc};

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{
        HeaderMap, HeaderName, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use tracing::info;
use uuid::Uuid;

use crate::{
    config::AppConfig,
    credentials::{CookieSlot, CookieStore, SlotStatus, THREADS_FROM_INSTAGRAM},
    engine::{EngineReport, ExtractionEngine},
    error::ApiError,
    files::{DOWNLOAD_MIME, build_content_disposition, remove_quietly},
    invoker::{AttemptStatus, Dispatcher, DownloadOptions, DownloadResult},
    session::{SESSION_IDLE_TTL, SessionRegistry},
    settings::{ApiKeyStatus, ApiKeyStore},
};

const INDEX_HTML: &str = include_str!("page.html");

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub dispatcher: Arc<Dispatcher>,
    pub cookies: CookieStore,
    pub sessions: SessionRegistry,
    pub api_keys: ApiKeyStore,
}

impl AppState {
    pub async fn new(config: AppConfig, engine: Arc<dyn ExtractionEngine>) -> Self {
        let cookies = CookieStore::new(&config.work_dir);
        let dispatcher = Dispatcher::new(
            Arc::clone(&engine),
            cookies.clone(),
            config.work_dir.clone(),
            DownloadOptions::from_settings(&config.engine, config.sync_threads_cookies),
        );
        let api_keys =
            ApiKeyStore::load(config.config_file.clone(), config.api_key_secret.clone()).await;

        Self {
            config: Arc::new(config),
            engine,
            dispatcher: Arc::new(dispatcher),
            cookies,
            sessions: SessionRegistry::new(SESSION_IDLE_TTL),
            api_keys,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    url: String,
    #[serde(default = "default_use_cookies")]
    use_cookies: bool,
    session_id: Option<Uuid>,
}

fn default_use_cookies() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct DownloadResponse {
    pub session_id: Uuid,
    #[serde(flatten)]
    pub result: DownloadResult,
}

#[derive(Debug, Serialize)]
pub struct CookieUploadResponse {
    slot: CookieSlot,
    entries: usize,
    synced_sibling: bool,
}

#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    api_key: String,
}

pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn engine_report(State(state): State<AppState>) -> Json<EngineReport> {
    let version = state.engine.version().await;
    Json(EngineReport::from_version(
        version,
        &state.config.engine.expected_version_prefixes,
    ))
}

pub async fn cookie_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<SlotStatus>>, ApiError> {
    Ok(Json(state.cookies.status().await?))
}

pub async fn upload_cookies(
    State(state): State<AppState>,
    Path(slot): Path<String>,
    body: Bytes,
) -> Result<Json<CookieUploadResponse>, ApiError> {
    let slot: CookieSlot = slot.parse()?;
    let entries = state.cookies.save(slot, &body).await?;

    let synced_sibling = if slot == CookieSlot::Instagram && state.config.sync_threads_cookies {
        state
            .cookies
            .sync_sibling(slot, &THREADS_FROM_INSTAGRAM)
            .await?
    } else {
        false
    };

    Ok(Json(CookieUploadResponse {
        slot,
        entries,
        synced_sibling,
    }))
}

pub async fn get_api_key(State(state): State<AppState>) -> Json<ApiKeyStatus> {
    Json(state.api_keys.status().await)
}

pub async fn put_api_key(
    State(state): State<AppState>,
    Json(payload): Json<ApiKeyRequest>,
) -> Result<Json<ApiKeyStatus>, ApiError> {
    Ok(Json(state.api_keys.save(&payload.api_key).await?))
}

pub async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<DownloadRequest>,
) -> Result<Json<DownloadResponse>, ApiError> {
    if payload.url.trim().is_empty() {
        return Err(ApiError::bad_request("Paste a video link first."));
    }

    for orphan in state.sessions.prune_idle(Utc::now()).await {
        remove_quietly(&orphan).await;
    }

    let session = state.sessions.get_or_create(payload.session_id).await;
    let mut session_state = session.state.lock().await;

    if state.config.cleanup_previous_download
        && let Some(previous) = session_state
            .latest
            .take()
            .and_then(|result| result.file_path)
    {
        remove_quietly(&previous).await;
    }

    let result = state
        .dispatcher
        .download(&payload.url, payload.use_cookies)
        .await;

    session_state.latest = Some(result.clone());
    session_state.last_seen = Utc::now();

    Ok(Json(DownloadResponse {
        session_id: session.id,
        result,
    }))
}

pub async fn download_file(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let session = state
        .sessions
        .get(session_id)
        .await
        .ok_or_else(|| ApiError::not_found("Unknown or expired session."))?;

    let (path, filename) = {
        let mut session_state = session.state.lock().await;
        session_state.last_seen = Utc::now();
        match session_state.latest.as_ref() {
            Some(DownloadResult {
                status: AttemptStatus::Succeeded,
                file_path: Some(path),
                file_name: Some(filename),
                ..
            }) => (path.clone(), filename.clone()),
            _ => return Err(ApiError::not_found("No downloaded video in this session.")),
        }
    };

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => {
            return Err(ApiError::not_found(
                "The downloaded video is no longer available. Download it again.",
            ));
        }
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not open the downloaded video: {error}"
            )));
        }
    };
    let metadata = file.metadata().await.map_err(|error| {
        ApiError::internal(format!("Could not read the downloaded video: {error}"))
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(DOWNLOAD_MIME));
    headers.insert(
        CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::internal("Could not build the content length."))?,
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&build_content_disposition(&filename))
            .map_err(|_| ApiError::internal("Could not build the download header."))?,
    );
    headers.insert(
        HeaderName::from_static("x-download-filename"),
        HeaderValue::from_str(&urlencoding::encode(&filename))
            .map_err(|_| ApiError::internal("Could not build the file name header."))?,
    );

    info!("Serving {:?} as {:?}", path, filename);
    let body = Body::from_stream(ReaderStream::new(file));
    Ok((headers, body).into_response())
}

#[cfg(test)]
mod tests {
    use std::{path::Path as FsPath, sync::Mutex, time::Duration};

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        engine::{EngineError, ExtractedMedia, ExtractionRequest},
        invoker::{AUTH_HINT, tests::FakeEngine},
    };

    const IG_JAR: &str = ".instagram.com\tTRUE\t/\tTRUE\t1767225600\tsessionid\tabc\n";

    async fn state_with(dir: &TempDir, engine: Arc<FakeEngine>) -> AppState {
        state_with_vars(dir, engine, &[]).await
    }

    async fn state_with_vars(
        dir: &TempDir,
        engine: Arc<dyn ExtractionEngine>,
        vars: &[(&str, &str)],
    ) -> AppState {
        let config = AppConfig::from_lookup(dir.path(), |name| match name {
            "WORK_DIR" => Some(dir.path().to_string_lossy().into_owned()),
            _ => vars
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string()),
        });
        AppState::new(config, engine).await
    }

    /// Holds every extraction until the test releases it.
    #[derive(Default)]
    struct GatedEngine {
        events: Mutex<Vec<&'static str>>,
        release: Notify,
    }

    impl GatedEngine {
        fn events(&self) -> Vec<&'static str> {
            self.events.lock().unwrap().clone()
        }

        async fn wait_for_starts(&self, count: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.events().iter().filter(|event| **event == "start").count() < count {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    #[async_trait]
    impl ExtractionEngine for GatedEngine {
        async fn extract(
            &self,
            request: &ExtractionRequest,
        ) -> Result<ExtractedMedia, EngineError> {
            self.events.lock().unwrap().push("start");
            self.release.notified().await;
            self.events.lock().unwrap().push("end");

            let file_path = request
                .output_dir
                .join(format!("{}.mp4", request.output_stem));
            tokio::fs::write(&file_path, b"data")
                .await
                .map_err(|_| EngineError::MissingOutput)?;
            Ok(ExtractedMedia {
                file_path,
                title: None,
            })
        }

        async fn version(&self) -> Result<String, EngineError> {
            Ok("2025.10.22".to_string())
        }
    }

    fn request(url: &str, session_id: Option<Uuid>) -> Json<DownloadRequest> {
        Json(DownloadRequest {
            url: url.to_string(),
            use_cookies: true,
            session_id,
        })
    }

    fn header<'a>(response: &'a Response, name: &str) -> &'a str {
        response
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn threads_scenario_end_to_end() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::succeeding("Sunset: take 2"));
        let state = state_with(&dir, Arc::clone(&engine)).await;

        let Json(uploaded) = upload_cookies(
            State(state.clone()),
            Path("instagram".to_string()),
            Bytes::from_static(IG_JAR.as_bytes()),
        )
        .await
        .unwrap();
        assert!(uploaded.synced_sibling);

        let Json(response) = start_download(
            State(state.clone()),
            request("https://www.threads.com/@user/post/123?hl=en", None),
        )
        .await
        .unwrap();

        assert_eq!(response.result.status, AttemptStatus::Succeeded);
        assert_eq!(
            response.result.canonical_url,
            "https://www.threads.net/@user/post/123"
        );
        assert_eq!(response.result.cookie_slot, Some(CookieSlot::Instagram));

        let calls = engine.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].url, "https://www.threads.net/@user/post/123");
        assert_eq!(
            calls[0].cookie_file.as_deref(),
            Some(dir.path().join("ig_cookies.txt").as_path())
        );

        let file = download_file(State(state), Path(response.session_id))
            .await
            .unwrap();
        assert_eq!(file.status(), StatusCode::OK);
        assert_eq!(header(&file, "content-type"), "video/mp4");
        assert_eq!(
            header(&file, "content-disposition"),
            "attachment; filename=\"Sunset take 2.mp4\"; filename*=UTF-8''Sunset%20take%202.mp4"
        );
        assert_eq!(header(&file, "content-length"), "12");
    }

    #[tokio::test]
    async fn login_required_response_includes_hint() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::failing(
            "ERROR: [Instagram] abc: Requested content is not available, rate-limit reached or Login required",
        ));
        let state = state_with(&dir, engine).await;

        let Json(response) = start_download(
            State(state.clone()),
            request("https://www.instagram.com/reel/abc/", None),
        )
        .await
        .unwrap();

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "failed");
        assert_eq!(body["hint"], AUTH_HINT);
        assert!(body.get("file_path").is_none());

        let error = download_file(State(state), Path(response.session_id))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_url_is_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::succeeding("x"));
        let state = state_with(&dir, Arc::clone(&engine)).await;

        let error = start_download(State(state), request("   ", None))
            .await
            .unwrap_err();

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn next_attempt_removes_previous_file() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::succeeding("clip"));
        let state = state_with(&dir, engine).await;

        let Json(first) = start_download(State(state.clone()), request("https://fb.watch/a/", None))
            .await
            .unwrap();
        let first_path = first.result.file_path.clone().unwrap();
        assert!(FsPath::new(&first_path).exists());

        let Json(second) = start_download(
            State(state.clone()),
            request("https://fb.watch/b/", Some(first.session_id)),
        )
        .await
        .unwrap();

        assert_eq!(second.session_id, first.session_id);
        assert!(!first_path.exists());
        assert!(second.result.file_path.unwrap().exists());
    }

    #[tokio::test]
    async fn previous_file_is_kept_when_cleanup_is_off() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(FakeEngine::succeeding("clip"));
        let state =
            state_with_vars(&dir, engine, &[("CLEANUP_PREVIOUS_DOWNLOAD", "false")]).await;
        assert!(!state.config.cleanup_previous_download);

        let Json(first) = start_download(State(state.clone()), request("https://fb.watch/a/", None))
            .await
            .unwrap();
        let first_path = first.result.file_path.clone().unwrap();

        let Json(second) = start_download(
            State(state.clone()),
            request("https://fb.watch/b/", Some(first.session_id)),
        )
        .await
        .unwrap();

        let second_path = second.result.file_path.unwrap();
        assert_ne!(first_path, second_path);
        assert!(first_path.exists());
        assert!(second_path.exists());
    }

    #[tokio::test]
    async fn attempts_in_one_session_run_one_at_a_time() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(GatedEngine::default());
        let state = state_with_vars(&dir, engine.clone() as Arc<dyn ExtractionEngine>, &[]).await;
        let session = state.sessions.get_or_create(None).await;

        let first = tokio::spawn(start_download(
            State(state.clone()),
            request("https://fb.watch/a/", Some(session.id)),
        ));
        engine.wait_for_starts(1).await;

        let second = tokio::spawn(start_download(
            State(state.clone()),
            request("https://fb.watch/b/", Some(session.id)),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(engine.events(), ["start"]);

        engine.release.notify_one();
        engine.wait_for_starts(2).await;
        assert_eq!(engine.events(), ["start", "end", "start"]);

        engine.release.notify_one();
        let Json(first) = first.await.unwrap().unwrap();
        let Json(second) = second.await.unwrap().unwrap();

        assert_eq!(first.session_id, session.id);
        assert_eq!(second.session_id, session.id);
        assert_eq!(engine.events(), ["start", "end", "start", "end"]);
    }

    #[tokio::test]
    async fn unknown_session_has_no_file() {
        let dir = TempDir::new().unwrap();
        let state = state_with(&dir, Arc::new(FakeEngine::succeeding("x"))).await;

        let error = download_file(State(state), Path(Uuid::new_v4()))
            .await
            .unwrap_err();
        assert_eq!(error.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn uploads_reject_unknown_slots_and_sync_instagram() {
        let dir = TempDir::new().unwrap();
        let state = state_with(&dir, Arc::new(FakeEngine::succeeding("x"))).await;

        let error = upload_cookies(
            State(state.clone()),
            Path("tiktok".to_string()),
            Bytes::from_static(IG_JAR.as_bytes()),
        )
        .await
        .unwrap_err();
        assert_eq!(error.status, StatusCode::BAD_REQUEST);

        let Json(uploaded) = upload_cookies(
            State(state.clone()),
            Path("instagram".to_string()),
            Bytes::from_static(IG_JAR.as_bytes()),
        )
        .await
        .unwrap();
        assert_eq!(uploaded.entries, 1);
        assert!(uploaded.synced_sibling);

        let Json(statuses) = cookie_status(State(state)).await.unwrap();
        let instagram = statuses
            .iter()
            .find(|status| status.slot == CookieSlot::Instagram)
            .unwrap();
        assert_eq!(instagram.entries, 2);
    }

    #[tokio::test]
    async fn engine_report_uses_configured_prefixes() {
        let dir = TempDir::new().unwrap();
        let state = state_with(&dir, Arc::new(FakeEngine::succeeding("x"))).await;

        let Json(report) = engine_report(State(state)).await;

        assert_eq!(report.version.as_deref(), Some("2025.10.22"));
        assert!(!report.outdated);
    }
}
