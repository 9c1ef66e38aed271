//! Media catalog boundary.
//!
//! The OS media index and the permission prompt are external collaborators;
//! they are consumed through [`MediaCatalog`] and [`PermissionGate`].
//! [`MediaLibrary`] combines both for the home screen's two tabs and asks for
//! permission at most once.

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use toonie_types::{MediaAsset, MediaKind};

use crate::error::{PlayerError, Result};
use crate::view::display_name_from_uri;

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "mkv", "webm", "m4v", "3gp"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "flac", "wav", "ogg", "opus"];

/// Answer from the platform permission prompt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Read-only source of discoverable media assets.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    async fn list_assets(&self, kind: MediaKind) -> Result<Vec<MediaAsset>>;
}

/// Platform media-access prompt.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_media_permission(&self) -> PermissionStatus;
}

/// Gate with a fixed answer, for hosts without a permission model.
#[derive(Clone, Copy, Debug)]
pub struct StaticPermission(pub PermissionStatus);

#[async_trait]
impl PermissionGate for StaticPermission {
    async fn request_media_permission(&self) -> PermissionStatus {
        self.0
    }
}

/// Contents of the `Videos` and `Music` tabs.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct MediaTabs {
    pub videos: Vec<MediaAsset>,
    pub audios: Vec<MediaAsset>,
}

/// Permission-gated access to a catalog.
pub struct MediaLibrary<C, G> {
    catalog: C,
    gate: G,
    permission: Mutex<Option<PermissionStatus>>,
}

impl<C: MediaCatalog, G: PermissionGate> MediaLibrary<C, G> {
    pub fn new(catalog: C, gate: G) -> Self {
        Self {
            catalog,
            gate,
            permission: Mutex::new(None),
        }
    }

    /// Ask for permission once; a denial is remembered and never re-prompted.
    pub async fn ensure_permission(&self) -> Result<()> {
        let cached = *self.permission.lock().unwrap_or_else(|err| err.into_inner());
        let status = match cached {
            Some(status) => status,
            None => {
                let status = self.gate.request_media_permission().await;
                tracing::info!(granted = status == PermissionStatus::Granted, "media permission answered");
                *self.permission.lock().unwrap_or_else(|err| err.into_inner()) = Some(status);
                status
            }
        };
        match status {
            PermissionStatus::Granted => Ok(()),
            PermissionStatus::Denied => Err(PlayerError::PermissionDenied),
        }
    }

    pub async fn list(&self, kind: MediaKind) -> Result<Vec<MediaAsset>> {
        self.ensure_permission().await?;
        self.catalog.list_assets(kind).await
    }

    /// Load both tabs of the home screen.
    pub async fn load_tabs(&self) -> Result<MediaTabs> {
        self.ensure_permission().await?;
        let videos = self.catalog.list_assets(MediaKind::Video).await?;
        let audios = self.catalog.list_assets(MediaKind::Audio).await?;
        tracing::debug!(videos = videos.len(), audios = audios.len(), "media tabs loaded");
        Ok(MediaTabs { videos, audios })
    }
}

/// Catalog backed by a directory tree on disk.
#[derive(Clone, Debug)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Classify a path by its file extension.
pub fn kind_for_path(path: &Path) -> Option<MediaKind> {
    let ext = path
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or("")
        .to_ascii_lowercase();
    if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Video)
    } else if AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        Some(MediaKind::Audio)
    } else {
        None
    }
}

/// Build a `file://` URI with percent-encoded path segments.
pub fn file_uri(path: &Path) -> String {
    let encoded: Vec<String> = path
        .to_string_lossy()
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect();
    let joined = encoded.join("/");
    if joined.starts_with('/') {
        format!("file://{joined}")
    } else {
        format!("file:///{joined}")
    }
}

/// Describe a single file as an asset, if it is a recognised media file.
pub fn asset_for_path(path: &Path) -> Option<MediaAsset> {
    let kind = kind_for_path(path)?;
    let uri = file_uri(path);
    let display_name = display_name_from_uri(&uri);
    Some(MediaAsset::new(
        path.to_string_lossy().into_owned(),
        display_name,
        kind,
        uri,
    ))
}

fn map_io(err: io::Error, path: &Path) -> PlayerError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        PlayerError::PermissionDenied
    } else {
        PlayerError::CatalogUnavailable(format!("{}: {err}", path.display()))
    }
}

#[async_trait]
impl MediaCatalog for DirectoryCatalog {
    async fn list_assets(&self, kind: MediaKind) -> Result<Vec<MediaAsset>> {
        let mut pending = vec![self.root.clone()];
        let mut found = Vec::new();
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|err| map_io(err, &dir))?;
            while let Some(entry) = entries.next_entry().await.map_err(|err| map_io(err, &dir))? {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(file_type) => file_type,
                    Err(err) => {
                        tracing::debug!(path = %path.display(), error = %err, "skipping unreadable entry");
                        continue;
                    }
                };
                if file_type.is_dir() {
                    pending.push(path);
                } else if kind_for_path(&path) == Some(kind) {
                    if let Some(asset) = asset_for_path(&path) {
                        found.push(asset);
                    }
                }
            }
        }
        found.sort_by(|a, b| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingGate {
        answer: PermissionStatus,
        prompts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PermissionGate for CountingGate {
        async fn request_media_permission(&self) -> PermissionStatus {
            self.prompts.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[tokio::test]
    async fn directory_catalog_filters_and_sorts_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "b movie.mp4");
        touch(dir.path(), "A clip.MOV");
        touch(dir.path(), "song.mp3");
        touch(dir.path(), "notes.txt");
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        touch(&dir.path().join("nested"), "live.flac");

        let catalog = DirectoryCatalog::new(dir.path());
        let videos = catalog.list_assets(MediaKind::Video).await.unwrap();
        let names: Vec<_> = videos.iter().map(|a| a.display_name.as_str()).collect();
        assert_eq!(names, vec!["A clip.MOV", "b movie.mp4"]);
        assert!(videos[1].uri.starts_with("file:///"));
        assert!(videos[1].uri.ends_with("b%20movie.mp4"));

        let audios = catalog.list_assets(MediaKind::Audio).await.unwrap();
        let names: Vec<_> = audios.iter().map(|a| a.display_name.as_str()).collect();
        assert_eq!(names, vec!["live.flac", "song.mp3"]);
    }

    #[tokio::test]
    async fn missing_directory_is_catalog_unavailable() {
        let catalog = DirectoryCatalog::new("/definitely/not/here");
        let err = catalog.list_assets(MediaKind::Video).await.unwrap_err();
        assert!(matches!(err, PlayerError::CatalogUnavailable(_)));
    }

    #[tokio::test]
    async fn denied_permission_is_never_reprompted() {
        let dir = tempfile::tempdir().unwrap();
        let prompts = Arc::new(AtomicUsize::new(0));
        let library = MediaLibrary::new(
            DirectoryCatalog::new(dir.path()),
            CountingGate {
                answer: PermissionStatus::Denied,
                prompts: prompts.clone(),
            },
        );

        assert_eq!(library.load_tabs().await.unwrap_err(), PlayerError::PermissionDenied);
        assert_eq!(
            library.list(MediaKind::Audio).await.unwrap_err(),
            PlayerError::PermissionDenied
        );
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn granted_library_loads_both_tabs() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "clip.mp4");
        touch(dir.path(), "tune.m4a");
        let library = MediaLibrary::new(
            DirectoryCatalog::new(dir.path()),
            StaticPermission(PermissionStatus::Granted),
        );
        let tabs = library.load_tabs().await.unwrap();
        assert_eq!(tabs.videos.len(), 1);
        assert_eq!(tabs.audios.len(), 1);
        assert_eq!(tabs.audios[0].kind, MediaKind::Audio);
    }

    #[test]
    fn classifies_extensions_case_insensitively() {
        assert_eq!(kind_for_path(Path::new("x/Y.MP4")), Some(MediaKind::Video));
        assert_eq!(kind_for_path(Path::new("track.opus")), Some(MediaKind::Audio));
        assert_eq!(kind_for_path(Path::new("README")), None);
    }
}
