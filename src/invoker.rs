//! One download attempt: canonicalize the link, pick credentials, run the
//! engine once and report what happened.

use std::{path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use url::Url;

use crate::{
    canonical::canonicalize,
    config::EngineSettings,
    credentials::{CookieSlot, CookieStore, THREADS_FROM_INSTAGRAM},
    engine::{ApiHostHint, DEFAULT_FORMAT, ExtractionEngine, ExtractionRequest},
    files::{download_file_name, unique_stem},
};

pub const AUTH_HINT: &str = "This post needs a logged-in session. Upload fresh cookies for this platform (Instagram cookies also cover Threads) and try again.";
const FALLBACK_TITLE: &str = "video";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadResult {
    pub status: AttemptStatus,
    pub canonical_url: String,
    pub cookie_slot: Option<CookieSlot>,
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
    pub title: Option<String>,
    pub file_name: Option<String>,
    pub error: Option<String>,
    pub hint: Option<String>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub format: String,
    pub headers: Vec<(String, String)>,
    pub tiktok_api_hostname: Option<String>,
    pub sync_threads_cookies: bool,
}

impl DownloadOptions {
    pub fn from_settings(engine: &EngineSettings, sync_threads_cookies: bool) -> Self {
        Self {
            format: DEFAULT_FORMAT.to_string(),
            headers: vec![
                ("User-Agent".to_string(), engine.user_agent.clone()),
                ("Accept-Language".to_string(), engine.accept_language.clone()),
            ],
            tiktok_api_hostname: engine.tiktok_api_hostname.clone(),
            sync_threads_cookies,
        }
    }
}

pub fn auth_hint(reason: &str) -> Option<&'static str> {
    reason
        .to_ascii_lowercase()
        .contains("login required")
        .then_some(AUTH_HINT)
}

pub struct Dispatcher {
    engine: Arc<dyn ExtractionEngine>,
    cookies: CookieStore,
    work_dir: PathBuf,
    options: DownloadOptions,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn ExtractionEngine>,
        cookies: CookieStore,
        work_dir: PathBuf,
        options: DownloadOptions,
    ) -> Self {
        Self {
            engine,
            cookies,
            work_dir,
            options,
        }
    }

    pub async fn download(&self, raw_url: &str, use_cookies: bool) -> DownloadResult {
        let canonical_url = canonicalize(raw_url);
        let selected = self.cookies.select(&canonical_url, use_cookies).await;
        let cookie_slot = selected.as_ref().map(|selected| selected.slot);

        info!(
            "Download attempt url={canonical_url} cookies={}",
            cookie_slot.map_or("none", CookieSlot::as_str)
        );

        if self.options.sync_threads_cookies
            && cookie_slot == Some(CookieSlot::Instagram)
            && let Err(error) = self
                .cookies
                .sync_sibling(CookieSlot::Instagram, &THREADS_FROM_INSTAGRAM)
                .await
        {
            warn!("Could not extend Instagram cookies to Threads: {error}");
        }

        let request = ExtractionRequest {
            url: canonical_url.clone(),
            output_dir: self.work_dir.clone(),
            output_stem: unique_stem(Utc::now()),
            format: self.options.format.clone(),
            headers: self.options.headers.clone(),
            cookie_file: selected.map(|selected| selected.path),
            api_host_hint: self.api_host_hint(&canonical_url),
        };

        match self.engine.extract(&request).await {
            Ok(media) => {
                let title = media
                    .title
                    .filter(|title| !title.trim().is_empty())
                    .unwrap_or_else(|| FALLBACK_TITLE.to_string());
                info!("Downloaded {:?} to {:?}", title, media.file_path);

                DownloadResult {
                    status: AttemptStatus::Succeeded,
                    canonical_url,
                    cookie_slot,
                    file_path: Some(media.file_path),
                    file_name: Some(download_file_name(&title)),
                    title: Some(title),
                    error: None,
                    hint: None,
                    finished_at: Utc::now(),
                }
            }
            Err(error) => {
                let reason = error.to_string();
                warn!("Download failed for {canonical_url}: {reason}");

                DownloadResult {
                    status: AttemptStatus::Failed,
                    canonical_url,
                    cookie_slot,
                    file_path: None,
                    title: None,
                    file_name: None,
                    hint: auth_hint(&reason).map(ToString::to_string),
                    error: Some(reason),
                    finished_at: Utc::now(),
                }
            }
        }
    }

    fn api_host_hint(&self, canonical_url: &str) -> Option<ApiHostHint> {
        let hostname = self.options.tiktok_api_hostname.as_ref()?;
        let is_tiktok = Url::parse(canonical_url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
            .is_some_and(|host| host == "tiktok.com" || host.ends_with(".tiktok.com"));

        is_tiktok.then(|| ApiHostHint {
            extractor: "tiktok",
            hostname: hostname.clone(),
        })
    }
}
