//! Artifact store: two flat directories of uuid-named media files.
//!
//! The filesystem is the only index. Names are generated here and never
//! derived from client input, so a name that does not match
//! [`is_valid_artifact_name`] can be rejected without touching the disk.

pub mod sweeper;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EditError;

const MAX_EXTENSION_LEN: usize = 8;
const MAX_STEM_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Upload,
    Processed,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Upload => "upload",
            ArtifactKind::Processed => "processed",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub name: String,
    pub kind: ArtifactKind,
    #[serde(skip)]
    pub path: PathBuf,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    /// Describe an existing file from its metadata.
    pub async fn inspect(kind: ArtifactKind, path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path).await?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Self {
            name,
            kind,
            path: path.to_path_buf(),
            size: metadata.len(),
            created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    uploads_dir: PathBuf,
    processed_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(uploads_dir: impl Into<PathBuf>, processed_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            processed_dir: processed_dir.into(),
        }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.uploads_dir, &self.processed_dir] {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create artifact directory: {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn dir(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Upload => &self.uploads_dir,
            ArtifactKind::Processed => &self.processed_dir,
        }
    }

    /// Reserve a fresh name and path; nothing is created on disk.
    pub fn allocate(&self, kind: ArtifactKind, extension: &str) -> (String, PathBuf) {
        let name = format!("{}.{}", Uuid::new_v4(), sanitize_extension(extension));
        let path = self.dir(kind).join(&name);
        (name, path)
    }

    pub async fn put_bytes(
        &self,
        kind: ArtifactKind,
        extension: &str,
        bytes: &[u8],
    ) -> Result<Artifact, EditError> {
        let (name, path) = self.allocate(kind, extension);
        fs::write(&path, bytes).await?;
        debug!(artifact = %name, %kind, size = bytes.len(), "Stored artifact");
        Ok(Artifact::inspect(kind, &path).await?)
    }

    /// Stream a body to a new artifact, enforcing `max_bytes`.
    /// Partial files are removed on any failure.
    pub async fn put_stream<S, E>(
        &self,
        kind: ArtifactKind,
        extension: &str,
        stream: S,
        max_bytes: u64,
    ) -> Result<Artifact, EditError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: fmt::Display,
    {
        let (name, path) = self.allocate(kind, extension);
        match write_stream(&path, stream, max_bytes).await {
            Ok(size) => {
                debug!(artifact = %name, %kind, size, "Stored streamed artifact");
                Ok(Artifact::inspect(kind, &path).await?)
            }
            Err(err) => {
                discard(&path).await;
                Err(err)
            }
        }
    }

    /// Resolve a client-supplied name to an existing file of the given kind.
    pub async fn resolve(&self, name: &str, kind: ArtifactKind) -> Result<PathBuf, EditError> {
        if !is_valid_artifact_name(name) {
            return Err(not_found(name));
        }
        let path = self.dir(kind).join(name);
        match fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(path),
            _ => Err(not_found(name)),
        }
    }

    /// Resolve against several kinds in order; the first hit wins.
    pub async fn resolve_any(
        &self,
        name: &str,
        kinds: &[ArtifactKind],
    ) -> Result<(ArtifactKind, PathBuf), EditError> {
        for kind in kinds {
            if let Ok(path) = self.resolve(name, *kind).await {
                return Ok((*kind, path));
            }
        }
        Err(not_found(name))
    }

    pub async fn describe(&self, name: &str, kind: ArtifactKind) -> Result<Artifact, EditError> {
        let path = self.resolve(name, kind).await?;
        Ok(Artifact::inspect(kind, &path).await?)
    }

    pub async fn remove(&self, name: &str, kind: ArtifactKind) -> Result<(), EditError> {
        let path = self.resolve(name, kind).await?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!(artifact = %name, %kind, "Removed artifact");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found(name)),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every file in both directories older than `max_age`.
    /// Per-file failures are logged and counted, never propagated.
    pub async fn sweep_expired(&self, max_age: Duration) -> SweepReport {
        let mut report = SweepReport::default();
        let now = SystemTime::now();

        for dir in [&self.uploads_dir, &self.processed_dir] {
            let mut entries = match fs::read_dir(dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "Failed to scan artifact directory");
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        warn!(dir = %dir.display(), error = %err, "Failed to read directory entry");
                        break;
                    }
                };
                let metadata = match entry.metadata().await {
                    Ok(metadata) if metadata.is_file() => metadata,
                    Ok(_) => continue,
                    Err(err) => {
                        warn!(path = %entry.path().display(), error = %err, "Failed to stat artifact");
                        report.failed += 1;
                        continue;
                    }
                };
                report.scanned += 1;

                let Ok(modified) = metadata.modified() else {
                    continue;
                };
                let age = now.duration_since(modified).unwrap_or_default();
                if age <= max_age {
                    continue;
                }

                let path = entry.path();
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        report.removed += 1;
                        info!(path = %path.display(), age_secs = age.as_secs(), "Evicted expired artifact");
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        report.failed += 1;
                        warn!(path = %path.display(), error = %err, "Failed to evict artifact");
                    }
                }
            }
        }

        report
    }
}

async fn write_stream<S, E>(path: &Path, mut stream: S, max_bytes: u64) -> Result<u64, EditError>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: fmt::Display,
{
    let mut file = fs::File::create(path).await?;
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|err| EditError::validation(format!("upload interrupted: {err}")))?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(EditError::TooLarge(format!(
                "file exceeds the {max_bytes} byte upload limit"
            )));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

/// Remove a file if present; used to roll back partial output.
pub async fn discard(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Discarded partial artifact"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to discard partial artifact"),
    }
}

fn not_found(name: &str) -> EditError {
    EditError::not_found(format!("file not found: {name}"))
}

/// `<stem>.<ext>` with a `[A-Za-z0-9-]` stem and alphanumeric extension.
pub fn is_valid_artifact_name(name: &str) -> bool {
    let Some((stem, extension)) = name.split_once('.') else {
        return false;
    };
    !stem.is_empty()
        && stem.len() <= MAX_STEM_LEN
        && stem.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !extension.is_empty()
        && extension.len() <= MAX_EXTENSION_LEN
        && extension.chars().all(|c| c.is_ascii_alphanumeric())
}

fn sanitize_extension(extension: &str) -> String {
    let cleaned: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(MAX_EXTENSION_LEN)
        .collect::<String>()
        .to_ascii_lowercase();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned
    }
}

/// Upload gate: only video and audio payloads are accepted.
pub fn is_media_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("video/") || essence.starts_with("audio/")
}

/// Pick the stored extension for an upload: the client filename's suffix when
/// it looks like a real extension, otherwise one implied by the content type.
pub fn upload_extension(original_name: Option<&str>, content_type: &str) -> String {
    let from_name = original_name
        .and_then(|name| Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map(str::to_ascii_lowercase);
    if let Some(extension) = from_name {
        return extension;
    }

    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if let Some((_, extension)) = PREFERRED_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == essence)
    {
        return extension.to_string();
    }
    // mime_guess lists extensions alphabetically, so only trust it for types
    // missing from the table above.
    mime_guess::get_mime_extensions_str(&essence)
        .and_then(|extensions| extensions.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

const PREFERRED_EXTENSIONS: &[(&str, &str)] = &[
    ("video/mp4", "mp4"),
    ("video/quicktime", "mov"),
    ("video/webm", "webm"),
    ("video/x-matroska", "mkv"),
    ("video/x-msvideo", "avi"),
    ("video/x-flv", "flv"),
    ("video/mpeg", "mpg"),
    ("video/mp2t", "ts"),
    ("video/ogg", "ogv"),
    ("video/3gpp", "3gp"),
    ("audio/mpeg", "mp3"),
    ("audio/mp3", "mp3"),
    ("audio/mp4", "m4a"),
    ("audio/x-m4a", "m4a"),
    ("audio/aac", "aac"),
    ("audio/wav", "wav"),
    ("audio/x-wav", "wav"),
    ("audio/ogg", "ogg"),
    ("audio/webm", "weba"),
    ("audio/flac", "flac"),
    ("audio/x-flac", "flac"),
];

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures::stream;
    use tempfile::{tempdir, TempDir};

    use super::*;

    fn test_store() -> (TempDir, ArtifactStore) {
        let root = tempdir().expect("tempdir");
        let store = ArtifactStore::new(root.path().join("uploads"), root.path().join("processed"));
        (root, store)
    }

    fn age_file(path: &Path, age: Duration) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(path)
            .expect("open for mtime update");
        file.set_modified(SystemTime::now() - age)
            .expect("set modification time");
    }

    #[tokio::test]
    async fn put_and_resolve_round_trip() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");

        let artifact = store
            .put_bytes(ArtifactKind::Upload, "MP4", b"hello")
            .await
            .expect("put");
        assert!(artifact.name.ends_with(".mp4"));
        assert!(is_valid_artifact_name(&artifact.name));
        assert_eq!(artifact.size, 5);

        let path = store
            .resolve(&artifact.name, ArtifactKind::Upload)
            .await
            .expect("resolve");
        assert_eq!(path, artifact.path);

        let err = store
            .resolve(&artifact.name, ArtifactKind::Processed)
            .await
            .expect_err("wrong directory");
        assert!(matches!(err, EditError::NotFound(_)));
    }

    #[tokio::test]
    async fn allocated_names_are_unique() {
        let (_root, store) = test_store();
        let (a, _) = store.allocate(ArtifactKind::Processed, "mp4");
        let (b, _) = store.allocate(ArtifactKind::Processed, "mp4");
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn traversal_names_are_rejected() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");
        for name in ["../config.toml", "..", "a/b.mp4", "x.mp4/..", ".hidden", "noext"] {
            let err = store
                .resolve(name, ArtifactKind::Upload)
                .await
                .expect_err("invalid name");
            assert!(matches!(err, EditError::NotFound(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn stream_over_limit_is_rejected_and_cleaned_up() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");

        let chunks = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from_static(b"0123456789")),
            Ok(Bytes::from_static(b"0123456789")),
        ]);
        let err = store
            .put_stream(ArtifactKind::Upload, "mp4", chunks, 15)
            .await
            .expect_err("over limit");
        assert!(matches!(err, EditError::TooLarge(_)));

        let mut entries = std::fs::read_dir(store.dir(ArtifactKind::Upload)).expect("read dir");
        assert!(entries.next().is_none(), "partial upload left behind");
    }

    #[tokio::test]
    async fn stream_within_limit_is_stored() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");
        let chunks = stream::iter(vec![
            Ok::<_, Infallible>(Bytes::from_static(b"abc")),
            Ok(Bytes::from_static(b"def")),
        ]);
        let artifact = store
            .put_stream(ArtifactKind::Upload, "webm", chunks, 6)
            .await
            .expect("stored");
        assert_eq!(artifact.size, 6);
        assert_eq!(std::fs::read(&artifact.path).expect("read"), b"abcdef");
    }

    #[tokio::test]
    async fn remove_deletes_and_then_reports_missing() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");
        let artifact = store
            .put_bytes(ArtifactKind::Processed, "mp4", b"x")
            .await
            .expect("put");

        store
            .remove(&artifact.name, ArtifactKind::Processed)
            .await
            .expect("remove");
        assert!(!artifact.path.exists());
        assert!(matches!(
            store.remove(&artifact.name, ArtifactKind::Processed).await,
            Err(EditError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_any_prefers_first_kind() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");
        let upload = store
            .put_bytes(ArtifactKind::Upload, "mp4", b"u")
            .await
            .expect("put");
        std::fs::write(store.dir(ArtifactKind::Processed).join(&upload.name), b"p")
            .expect("write processed twin");

        let (kind, path) = store
            .resolve_any(&upload.name, &[ArtifactKind::Processed, ArtifactKind::Upload])
            .await
            .expect("resolve");
        assert_eq!(kind, ArtifactKind::Processed);
        assert_eq!(std::fs::read(path).expect("read"), b"p");
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_files() {
        let (_root, store) = test_store();
        store.ensure_dirs().await.expect("dirs");

        let old_upload = store
            .put_bytes(ArtifactKind::Upload, "mp4", b"old")
            .await
            .expect("put");
        let old_output = store
            .put_bytes(ArtifactKind::Processed, "mp4", b"old")
            .await
            .expect("put");
        let fresh = store
            .put_bytes(ArtifactKind::Processed, "mp4", b"fresh")
            .await
            .expect("put");
        age_file(&old_upload.path, Duration::from_secs(2 * 3600));
        age_file(&old_output.path, Duration::from_secs(3 * 3600));

        let report = store.sweep_expired(Duration::from_secs(3600)).await;
        assert_eq!(
            report,
            SweepReport {
                scanned: 3,
                removed: 2,
                failed: 0
            }
        );
        assert!(!old_upload.path.exists());
        assert!(!old_output.path.exists());
        assert!(fresh.path.exists());
    }

    #[tokio::test]
    async fn sweep_tolerates_missing_directories() {
        let (_root, store) = test_store();
        let report = store.sweep_expired(Duration::ZERO).await;
        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn media_content_types_are_gated() {
        assert!(is_media_content_type("video/mp4"));
        assert!(is_media_content_type("Audio/MPEG; charset=binary"));
        assert!(!is_media_content_type("image/png"));
        assert!(!is_media_content_type("application/octet-stream"));
    }

    #[test]
    fn upload_extension_prefers_clean_client_suffix() {
        assert_eq!(upload_extension(Some("Holiday Clip.MOV"), "video/quicktime"), "mov");
        assert_eq!(upload_extension(Some("../../evil.m$4"), "video/mp4"), "mp4");
        assert_eq!(upload_extension(None, "audio/mpeg"), "mp3");
        assert_eq!(upload_extension(Some("noext"), "video/x-unknown"), "bin");
    }

    #[test]
    fn upload_extension_uses_conventional_suffix_for_common_types() {
        assert_eq!(upload_extension(None, "audio/mpeg"), "mp3");
        assert_eq!(upload_extension(Some("clip"), "video/x-matroska"), "mkv");
        assert_eq!(upload_extension(None, "Video/MP4; codecs=avc1"), "mp4");
        assert_eq!(upload_extension(None, "video/quicktime"), "mov");
        assert_eq!(upload_extension(None, "audio/x-wav"), "wav");
        assert_eq!(
            mime_guess::from_ext(&upload_extension(None, "audio/mpeg"))
                .first_or_octet_stream()
                .essence_str(),
            "audio/mpeg"
        );
    }
}
