use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::{debug, warn};

use crate::config::EngineSettings;

pub const DEFAULT_FORMAT: &str = "bestvideo+bestaudio/best";

/// Prints the final path and title as one JSON object once the file has
/// been moved into place.
const PRINT_RESULT: &str = "after_move:%(.{filepath,title})j";

#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine ran and gave up; carries its own diagnostic verbatim.
    #[error("{0}")]
    Failed(String),

    #[error("{program} is not installed or not on PATH")]
    NotInstalled { program: String },

    #[error("could not run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("the extraction engine did not finish within {0} seconds")]
    TimedOut(u64),

    #[error("the extraction engine reported success but the downloaded file was not found")]
    MissingOutput,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiHostHint {
    pub extractor: &'static str,
    pub hostname: String,
}

impl ApiHostHint {
    fn to_extractor_args(&self) -> String {
        format!("{}:api_hostname={}", self.extractor, self.hostname)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub url: String,
    pub output_dir: PathBuf,
    pub output_stem: String,
    pub format: String,
    pub headers: Vec<(String, String)>,
    pub cookie_file: Option<PathBuf>,
    pub api_host_hint: Option<ApiHostHint>,
}

impl ExtractionRequest {
    pub fn output_template(&self) -> String {
        format!(
            "{}/{}.%(ext)s",
            self.output_dir.to_string_lossy(),
            self.output_stem
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedMedia {
    pub file_path: PathBuf,
    pub title: Option<String>,
}

#[async_trait]
pub trait ExtractionEngine: Send + Sync {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedMedia, EngineError>;

    async fn version(&self) -> Result<String, EngineError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineReport {
    pub version: Option<String>,
    pub outdated: bool,
    pub expected_prefixes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl EngineReport {
    pub fn from_version(version: Result<String, EngineError>, expected: &[String]) -> Self {
        match version {
            Ok(version) => {
                let outdated = !expected.iter().any(|prefix| version.starts_with(prefix));
                let warning = outdated.then(|| {
                    format!(
                        "Extraction engine {version} looks outdated (expected a release from {}). Update yt-dlp and restart the service.",
                        expected.join(", ")
                    )
                });
                Self {
                    version: Some(version),
                    outdated,
                    expected_prefixes: expected.to_vec(),
                    warning,
                }
            }
            Err(error) => Self {
                version: None,
                outdated: false,
                expected_prefixes: expected.to_vec(),
                warning: Some(format!("Engine version unknown: {error}")),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct PrintedResult {
    filepath: Option<String>,
    title: Option<String>,
}

pub struct YtDlpEngine {
    program: String,
    timeout: Option<Duration>,
}

impl YtDlpEngine {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            program: settings.program.clone(),
            timeout: settings.timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, EngineError> {
        let mut command = Command::new(&self.program);
        command.args(args).kill_on_drop(true);
        let command_future = command.output();

        let finished = match self.timeout {
            Some(limit) => timeout(limit, command_future)
                .await
                .map_err(|_| EngineError::TimedOut(limit.as_secs()))?,
            None => command_future.await,
        };

        let output = finished.map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                EngineError::NotInstalled {
                    program: self.program.clone(),
                }
            } else {
                EngineError::Spawn {
                    program: self.program.clone(),
                    source: error,
                }
            }
        })?;

        if !output.status.success() {
            return Err(EngineError::Failed(failure_message(
                &output.stderr,
                output.status.code(),
            )));
        }

        Ok(output)
    }
}

#[async_trait]
impl ExtractionEngine for YtDlpEngine {
    async fn extract(&self, request: &ExtractionRequest) -> Result<ExtractedMedia, EngineError> {
        let args = build_args(request);
        debug!("Running {} {:?}", self.program, args);

        let output = self.run(args).await?;
        let printed = parse_printed_result(&output.stdout);
        let file_path = resolve_downloaded_file(
            &request.output_dir,
            &request.output_stem,
            printed.filepath.as_deref(),
        )
        .await?;

        Ok(ExtractedMedia {
            file_path,
            title: printed.title,
        })
    }

    async fn version(&self) -> Result<String, EngineError> {
        let output = self.run(vec!["--version".to_string()]).await?;
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(ToString::to_string)
            .ok_or_else(|| EngineError::Failed("the engine printed no version".to_string()))
    }
}

pub fn build_args(request: &ExtractionRequest) -> Vec<String> {
    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--quiet".to_string(),
        "--no-progress".to_string(),
        "-f".to_string(),
        request.format.clone(),
        "--merge-output-format".to_string(),
        "mp4".to_string(),
        "-o".to_string(),
        request.output_template(),
        "--print".to_string(),
        PRINT_RESULT.to_string(),
    ];

    for (name, value) in &request.headers {
        args.push("--add-header".to_string());
        args.push(format!("{name}:{value}"));
    }

    if let Some(cookie_file) = &request.cookie_file {
        args.push("--cookies".to_string());
        args.push(cookie_file.to_string_lossy().into_owned());
    }

    if let Some(hint) = &request.api_host_hint {
        args.push("--extractor-args".to_string());
        args.push(hint.to_extractor_args());
    }

    // Keeps a pasted value that starts with '-' from being read as an option.
    args.push("--".to_string());
    args.push(request.url.clone());
    args
}

/// The engine's `ERROR:` lines, or its last line of output when it printed
/// none.
fn failure_message(stderr: &[u8], status: Option<i32>) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let errors: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|line| line.starts_with("ERROR:"))
        .collect();

    if !errors.is_empty() {
        return errors.join("\n");
    }

    match (lines.last(), status) {
        (Some(line), _) => (*line).to_string(),
        (None, Some(code)) => format!("yt-dlp exited with status {code}"),
        (None, None) => "yt-dlp was terminated before finishing".to_string(),
    }
}

fn parse_printed_result(stdout: &[u8]) -> PrintedResult {
    let last_line = String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .map(ToString::to_string);

    let Some(line) = last_line else {
        return PrintedResult {
            filepath: None,
            title: None,
        };
    };

    serde_json::from_str::<PrintedResult>(&line).unwrap_or(PrintedResult {
        filepath: Some(line),
        title: None,
    })
}

async fn resolve_downloaded_file(
    output_dir: &Path,
    output_stem: &str,
    printed_path: Option<&str>,
) -> Result<PathBuf, EngineError> {
    let canonical_dir = tokio::fs::canonicalize(output_dir)
        .await
        .map_err(|_| EngineError::MissingOutput)?;

    if let Some(path_value) = printed_path {
        if let Some(valid_path) = download_candidate(&canonical_dir, Path::new(path_value)).await
        {
            return Ok(valid_path);
        }

        if let Some(valid_path) =
            download_candidate(&canonical_dir, &output_dir.join(path_value)).await
        {
            return Ok(valid_path);
        }
    }

    let prefix = format!("{output_stem}.");
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|_| EngineError::MissingOutput)?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let matches_stem = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(&prefix) && !name.ends_with(".part"));
        if !matches_stem {
            continue;
        }

        if let Some(valid_path) = download_candidate(&canonical_dir, &entry.path()).await {
            return Ok(valid_path);
        }
    }

    Err(EngineError::MissingOutput)
}

async fn download_candidate(canonical_dir: &Path, candidate: &Path) -> Option<PathBuf> {
    let metadata = tokio::fs::metadata(candidate).await.ok()?;
    if !metadata.is_file() {
        return None;
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate).await.ok()?;
    if !canonical_candidate.starts_with(canonical_dir) {
        warn!(
            "Ignoring a file outside the download directory: {:?}",
            canonical_candidate
        );
        return None;
    }

    Some(canonical_candidate)
}
