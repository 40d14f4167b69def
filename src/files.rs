use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

pub const DOWNLOAD_MIME: &str = "video/mp4";
const FALLBACK_TITLE: &str = "video";
const MEDIA_EXTENSIONS: [&str; 4] = ["mp4", "webm", "mkv", "part"];

pub fn unique_stem(now: DateTime<Utc>) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("video_{}_{}", now.timestamp(), &token[..8])
}

pub fn download_file_name(title: &str) -> String {
    let safe: String = title
        .chars()
        .filter(|character| character.is_alphanumeric() || *character == ' ')
        .collect();
    let safe = safe.trim();

    if safe.is_empty() {
        format!("{FALLBACK_TITLE}.mp4")
    } else {
        format!("{safe}.mp4")
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let mut sanitized = String::with_capacity(value.len());

    for character in value.chars() {
        if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_' | ' ') {
            sanitized.push(character);
        } else {
            sanitized.push('_');
        }
    }

    let compact = sanitized.trim();
    if compact.is_empty() {
        format!("{FALLBACK_TITLE}.mp4")
    } else {
        compact.to_string()
    }
}

pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => info!("Removed previous download {:?}", path),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => warn!("Could not remove previous download {:?}: {error}", path),
    }
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.as_str()))
}

/// Deletes media files in `dir` last modified more than `older_than` ago.
/// Cookie jars and anything else that is not media are left alone.
pub async fn cleanup_stale_media(dir: &Path, older_than: Duration) -> Vec<PathBuf> {
    let mut removed = Vec::new();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {:?} for cleanup: {error}", dir);
            }
            return removed;
        }
    };

    let now = SystemTime::now();

    loop {
        let maybe_entry = match entries.next_entry().await {
            Ok(value) => value,
            Err(error) => {
                warn!("Could not iterate {:?} for cleanup: {error}", dir);
                break;
            }
        };

        let Some(entry) = maybe_entry else {
            break;
        };

        let path = entry.path();
        if !is_media_file(&path) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();

        if age < older_than {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed.push(path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not delete stale file {:?}: {error}", path),
        }
    }

    if !removed.is_empty() {
        info!("Removed {} stale media file(s) from {:?}", removed.len(), dir);
    }

    removed
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn file_name_keeps_letters_digits_and_spaces() {
        assert_eq!(download_file_name("Cats & Dogs: Part 2!"), "Cats  Dogs Part 2.mp4");
        assert_eq!(download_file_name("  ../../etc/passwd "), "etcpasswd.mp4");
        assert_eq!(download_file_name("夜景 2024"), "夜景 2024.mp4");
        assert_eq!(download_file_name("🔥🔥"), "video.mp4");
        assert_eq!(download_file_name(""), "video.mp4");
    }

    #[test]
    fn content_disposition_has_ascii_and_utf8_names() {
        assert_eq!(
            build_content_disposition("夜景 2024.mp4"),
            "attachment; filename=\"__ 2024.mp4\"; filename*=UTF-8''%E5%A4%9C%E6%99%AF%202024.mp4"
        );
        assert_eq!(
            build_content_disposition("clip.mp4"),
            "attachment; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
    }

    #[test]
    fn stems_are_unique_and_timestamped() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let first = unique_stem(now);
        let second = unique_stem(now);

        assert!(first.starts_with(&format!("video_{}_", now.timestamp())));
        assert_eq!(first.len(), "video_1714564800_".len() + 8);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn cleanup_only_touches_media() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("video_1.mp4"), b"a").unwrap();
        std::fs::write(dir.path().join("video_2.WEBM"), b"b").unwrap();
        std::fs::write(dir.path().join("ig_cookies.txt"), b"c").unwrap();
        std::fs::create_dir(dir.path().join("nested.mp4")).unwrap();

        let removed = cleanup_stale_media(dir.path(), Duration::ZERO).await;

        assert_eq!(removed.len(), 2);
        assert!(!dir.path().join("video_1.mp4").exists());
        assert!(!dir.path().join("video_2.WEBM").exists());
        assert!(dir.path().join("ig_cookies.txt").exists());
        assert!(dir.path().join("nested.mp4").exists());
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("video_1.mp4"), b"a").unwrap();

        let removed = cleanup_stale_media(dir.path(), Duration::from_secs(3600)).await;

        assert!(removed.is_empty());
        assert!(dir.path().join("video_1.mp4").exists());
    }

    #[tokio::test]
    async fn remove_quietly_ignores_missing_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.mp4");
        remove_quietly(&path).await;

        std::fs::write(&path, b"x").unwrap();
        remove_quietly(&path).await;
        assert!(!path.exists());
    }
}
