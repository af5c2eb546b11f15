//! Filesystem-backed catalog.
//!
//! There is no database: every video lives in `<save_path>/<ID>/` and the
//! catalog is rebuilt by listing those directories. Records carry absolute
//! paths for internal use; the `summary`/`detail` projections turn them into
//! public URLs under `/media/<ID>/<file>`, prefixed with the configured base
//! URL.

use std::{
    collections::hash_map::DefaultHasher,
    fs,
    hash::{Hash, Hasher},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use walkdir::WalkDir;

use crate::identifier;

pub const DOWNLOAD_INFO_FILE: &str = "download_info.json";
pub const ARCHIVE_FILE: &str = "downloaded.txt";
pub const THUMB_DIR: &str = "thumb";

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp"];

/// Everything known about one video directory.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoRecord {
    pub id: String,
    pub title: Option<String>,
    pub poster: Option<PathBuf>,
    pub fanart: Vec<PathBuf>,
    pub video: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub poster: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VideoDetail {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub poster: Option<String>,
    pub fanart: Vec<String>,
    pub video: Option<String>,
}

/// Metadata the fetch pipeline stores next to the video.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DownloadInfo {
    #[serde(default)]
    pub m3u8: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub avid: String,
}

#[derive(Debug, Clone)]
pub struct Library {
    root: PathBuf,
    base_url: String,
}

impl Library {
    pub fn new(root: impl Into<PathBuf>, base_url: &str) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn video_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    pub fn archive_path(&self) -> PathBuf {
        self.root.join(ARCHIVE_FILE)
    }

    /// Actor avatars, shared by every video.
    pub fn thumb_dir(&self) -> PathBuf {
        self.root.join(THUMB_DIR)
    }

    /// Fingerprint of the save directory and every video directory in it:
    /// names, sizes and modification times. Any file appearing, disappearing
    /// or being rewritten changes it.
    pub fn version(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        let entries = WalkDir::new(&self.root)
            .max_depth(2)
            .sort_by_file_name()
            .into_iter()
            .filter_map(Result::ok);
        for entry in entries {
            entry.path().hash(&mut hasher);
            if let Ok(meta) = entry.metadata() {
                meta.len().hash(&mut hasher);
                meta.modified().ok().hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// Lists every video directory, sorted by identifier. A missing save
    /// directory is an empty catalog.
    pub fn scan(&self) -> Result<Vec<VideoRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.with_context(|| format!("listing {}", self.root.display()))?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            if !identifier::is_valid(name) {
                continue;
            }
            records.push(load_record(entry.path(), name)?);
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Loads one record; `None` when the directory does not exist.
    pub fn load(&self, id: &str) -> Result<Option<VideoRecord>> {
        if !identifier::is_valid(id) {
            return Ok(None);
        }
        let dir = self.video_dir(id);
        if !dir.is_dir() {
            return Ok(None);
        }
        load_record(&dir, id).map(Some)
    }

    /// Location of the finished video, if the pipeline produced one.
    pub fn find_video_file(&self, id: &str) -> Option<PathBuf> {
        let dir = self.video_dir(id);
        let preferred = dir.join(format!("{id}.mp4"));
        if preferred.is_file() {
            return Some(preferred);
        }
        list_files(&dir)
            .ok()?
            .into_iter()
            .find(|path| has_extension(path, &["mp4"]))
    }

    pub fn media_path(&self, id: &str, file: &str) -> PathBuf {
        self.video_dir(id).join(file)
    }

    /// Public URL of a file in a video directory, each segment
    /// percent-encoded.
    pub fn media_url(&self, id: &str, path: &Path) -> Option<String> {
        let file = path.file_name()?.to_str()?;
        let mut url = Url::parse("http://localhost/").ok()?;
        url.path_segments_mut().ok()?.clear().extend(["media", id, file]);
        Some(format!("{}{}", self.base_url, url.path()))
    }

    pub fn summary(&self, record: &VideoRecord) -> VideoSummary {
        VideoSummary {
            id: record.id.clone(),
            title: record.title.clone(),
            poster: record
                .poster
                .as_deref()
                .and_then(|path| self.media_url(&record.id, path)),
        }
    }

    pub fn detail(&self, record: &VideoRecord) -> VideoDetail {
        VideoDetail {
            id: record.id.clone(),
            title: record.title.clone(),
            poster: record
                .poster
                .as_deref()
                .and_then(|path| self.media_url(&record.id, path)),
            fanart: record
                .fanart
                .iter()
                .filter_map(|path| self.media_url(&record.id, path))
                .collect(),
            video: record
                .video
                .as_deref()
                .and_then(|path| self.media_url(&record.id, path)),
        }
    }
}

fn load_record(dir: &Path, id: &str) -> Result<VideoRecord> {
    let files = list_files(dir)?;
    let poster_stem = format!("{id}-poster");
    let fanart_prefix = format!("{id}-fanart-");
    let main_video = format!("{id}.mp4");

    let mut poster = None;
    let mut fanart: Vec<(u32, PathBuf)> = Vec::new();
    let mut video = None;
    let mut fallback_video = None;

    for path in files {
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        if has_extension(&path, IMAGE_EXTENSIONS) {
            let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("");
            if stem == poster_stem {
                poster = Some(path.clone());
            } else if let Some(number) = stem.strip_prefix(&fanart_prefix) {
                let order = number.parse::<u32>().unwrap_or(u32::MAX);
                fanart.push((order, path.clone()));
            }
        } else if name == main_video {
            video = Some(path.clone());
        } else if fallback_video.is_none() && has_extension(&path, &["mp4"]) {
            fallback_video = Some(path.clone());
        }
    }

    fanart.sort();
    let fanart: Vec<PathBuf> = fanart.into_iter().map(|(_, path)| path).collect();
    let poster = poster.or_else(|| fanart.first().cloned());

    Ok(VideoRecord {
        id: id.to_string(),
        title: read_title(dir),
        poster,
        fanart,
        video: video.or(fallback_video),
    })
}

fn read_title(dir: &Path) -> Option<String> {
    let path = dir.join(DOWNLOAD_INFO_FILE);
    let raw = fs::read_to_string(&path).ok()?;
    match serde_json::from_str::<DownloadInfo>(&raw) {
        Ok(info) => Some(info.title.trim().to_string()).filter(|title| !title.is_empty()),
        Err(err) => {
            warn!("ignoring unreadable {}: {err}", path.display());
            None
        }
    }
}

/// Regular files directly inside `dir`, sorted by name.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.with_context(|| format!("listing {}", dir.display()))?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn has_extension(path: &Path, allowed: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| allowed.iter().any(|candidate| ext.eq_ignore_ascii_case(candidate)))
        .unwrap_or(false)
}
