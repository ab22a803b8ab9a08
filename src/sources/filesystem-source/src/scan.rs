use crate::tags::parse_tags;
use medley_core::models::{Media, MediaId, MediaKind, TypeFilter};
use medley_core::playlist::{self, entry_path, PlaylistError, PlaylistFormat};
use medley_core::source::{SourceError, SourceResult};
use path_clean::PathClean;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use url::Url;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Clone)]
pub struct IndexedItem {
    pub media: Media,
    pub path: PathBuf,
    /// Containing directory, `None` for entries directly under a root.
    pub parent: Option<MediaId>,
    pub playlist: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LibraryIndex {
    pub roots: Vec<PathBuf>,
    pub items: BTreeMap<MediaId, IndexedItem>,
}

impl LibraryIndex {
    pub fn get(&self, id: &MediaId) -> Option<&IndexedItem> {
        self.items.get(id)
    }

    /// Children of `parent`: containers first, then by title, then id.
    pub fn children(&self, parent: Option<&MediaId>, filter: &TypeFilter) -> Vec<Media> {
        let mut children: Vec<Media> = self
            .items
            .values()
            .filter(|item| item.parent.as_ref() == parent && filter.allows(item.media.kind))
            .map(|item| item.media.clone())
            .collect();
        children.sort_by(|a, b| {
            b.is_container()
                .cmp(&a.is_container())
                .then_with(|| compare_titles(a, b))
        });
        children
    }

    /// Case-insensitive substring match over title, artist, album and genre.
    pub fn search(&self, query: &str, filter: &TypeFilter) -> Vec<Media> {
        let needle = query.to_lowercase();
        let hit = |value: Option<&str>| value.is_some_and(|v| v.to_lowercase().contains(&needle));
        let mut hits: Vec<Media> = self
            .items
            .values()
            .map(|item| &item.media)
            .filter(|m| filter.allows(m.kind))
            .filter(|m| {
                hit(Some(&m.title))
                    || hit(m.artist.as_deref())
                    || hit(m.album.as_deref())
                    || hit(m.genre.as_deref())
            })
            .cloned()
            .collect();
        hits.sort_by(compare_titles);
        hits
    }

    /// Resolve each entry of the playlist at `path` to media inside the
    /// roots. Non-local, out-of-root and unrecognised entries are skipped.
    pub fn expand_playlist(
        &self,
        source_id: &str,
        path: &Path,
    ) -> Result<Vec<Media>, PlaylistError> {
        let entries = playlist::parse_playlist(path)?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(local) = entry_path(&entry.uri) else {
                tracing::warn!(
                    playlist = %path.display(),
                    uri = %entry.uri,
                    "skipping non-local playlist entry"
                );
                continue;
            };
            let Some(confined) = self.confine(&local) else {
                tracing::debug!(
                    playlist = %path.display(),
                    uri = %entry.uri,
                    "skipping entry outside library roots"
                );
                continue;
            };
            let indexed = self
                .get(&MediaId::new(confined.to_string_lossy()))
                .map(|item| item.media.clone());
            let media = indexed.or_else(|| classify_file(source_id, &confined).map(|(m, _)| m));
            let Some(mut media) = media else {
                tracing::debug!(
                    playlist = %path.display(),
                    uri = %entry.uri,
                    "skipping unrecognised playlist entry"
                );
                continue;
            };
            if media.duration_seconds.is_none() {
                media.duration_seconds = entry.duration_seconds;
            }
            items.push(media);
        }
        Ok(items)
    }

    /// Canonical form of `path` if it lies inside one of the roots.
    pub fn confine(&self, path: &Path) -> Option<PathBuf> {
        self.roots
            .iter()
            .find_map(|root| canonicalize_within_root(path, root))
    }
}

fn compare_titles(a: &Media, b: &Media) -> std::cmp::Ordering {
    a.title
        .to_lowercase()
        .cmp(&b.title.to_lowercase())
        .then_with(|| a.id.cmp(&b.id))
}

fn canonicalize_within_root(path: &Path, root: &Path) -> Option<PathBuf> {
    let Ok(canon) = path.canonicalize() else {
        return None;
    };
    let cleaned = canon.clean();
    if cleaned.starts_with(root) {
        Some(cleaned)
    } else {
        None
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

/// Walk every root and index directories, media files and playlists.
pub fn scan_library(source_id: &str, roots: &[PathBuf]) -> SourceResult<LibraryIndex> {
    let mut index = LibraryIndex::default();
    for root in roots {
        let canonical_root = root
            .canonicalize()
            .map_err(|e| SourceError::NotFound {
                entity: format!("library root {}: {e}", root.display()),
            })?
            .clean();
        if !index.roots.contains(&canonical_root) {
            index.roots.push(canonical_root);
        }
    }

    for root in index.roots.clone() {
        let walker = WalkDir::new(&root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_hidden(e));
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(
                        root = %root.display(),
                        error = %err,
                        "skipping unreadable entry"
                    );
                    continue;
                }
            };
            let Some(path) = canonicalize_within_root(entry.path(), &root) else {
                continue;
            };
            let parent = path
                .parent()
                .filter(|p| *p != root.as_path())
                .map(|p| MediaId::new(p.to_string_lossy()));

            let indexed = if entry.file_type().is_dir() {
                Some((directory_media(source_id, &path), false))
            } else if entry.file_type().is_file() {
                classify_file(source_id, &path)
            } else {
                None
            };
            if let Some((media, playlist)) = indexed {
                index.items.insert(
                    media.id.clone(),
                    IndexedItem {
                        media,
                        path,
                        parent,
                        playlist,
                    },
                );
            }
        }
    }

    let mut counts: BTreeMap<MediaId, u32> = BTreeMap::new();
    for item in index.items.values() {
        if let Some(parent) = &item.parent {
            *counts.entry(parent.clone()).or_default() += 1;
        }
    }
    let playlists: Vec<(MediaId, PathBuf)> = index
        .items
        .values()
        .filter(|item| item.playlist)
        .map(|item| (item.media.id.clone(), item.path.clone()))
        .collect();
    for (id, path) in playlists {
        match index.expand_playlist(source_id, &path) {
            Ok(entries) => {
                counts.insert(id, u32::try_from(entries.len()).unwrap_or(u32::MAX));
            }
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "unreadable playlist"),
        }
    }
    for item in index.items.values_mut() {
        if item.media.is_container() {
            item.media.child_count = counts.get(&item.media.id).copied().or(Some(0));
        }
    }

    tracing::debug!(source_id, items = index.items.len(), "library scanned");
    Ok(index)
}

fn media_type(ext: &str) -> Option<(MediaKind, &'static str)> {
    let found = match ext.to_ascii_lowercase().as_str() {
        "mp3" => (MediaKind::Audio, "audio/mpeg"),
        "m4a" | "aac" => (MediaKind::Audio, "audio/mp4"),
        "flac" => (MediaKind::Audio, "audio/flac"),
        "wav" => (MediaKind::Audio, "audio/wav"),
        "ogg" | "oga" => (MediaKind::Audio, "audio/ogg"),
        "opus" => (MediaKind::Audio, "audio/opus"),
        "mp4" | "m4v" => (MediaKind::Video, "video/mp4"),
        "mkv" => (MediaKind::Video, "video/x-matroska"),
        "webm" => (MediaKind::Video, "video/webm"),
        "avi" => (MediaKind::Video, "video/x-msvideo"),
        "mov" => (MediaKind::Video, "video/quicktime"),
        "ogv" => (MediaKind::Video, "video/ogg"),
        "jpg" | "jpeg" => (MediaKind::Image, "image/jpeg"),
        "png" => (MediaKind::Image, "image/png"),
        "gif" => (MediaKind::Image, "image/gif"),
        "webp" => (MediaKind::Image, "image/webp"),
        _ => return None,
    };
    Some(found)
}

fn base_media(source_id: &str, path: &Path, kind: MediaKind) -> Media {
    let title = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());
    let mut media = Media::new(path.to_string_lossy().into_owned(), source_id, kind, title);
    media.url = Url::from_file_path(path).ok().map(String::from);
    media.modified = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    media
}

fn directory_media(source_id: &str, path: &Path) -> Media {
    let mut media = base_media(source_id, path, MediaKind::Container);
    if let Some(name) = path.file_name() {
        media.title = name.to_string_lossy().into_owned();
    }
    media.mime = Some("inode/directory".into());
    media
}

/// Build media for a regular file. The flag is set for playlists.
pub fn classify_file(source_id: &str, path: &Path) -> Option<(Media, bool)> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    if let Some((kind, mime)) = media_type(ext) {
        let mut media = base_media(source_id, path, kind);
        media.mime = Some(mime.into());
        if kind == MediaKind::Audio {
            let tags = parse_tags(path);
            if let Some(title) = tags.title {
                media.title = title;
            }
            media.artist = tags.artist;
            media.album = tags.album;
            media.genre = tags.genre;
            media.duration_seconds = tags.duration_seconds;
        }
        return Some((media, false));
    }

    let format = playlist::detect_format(path)?;
    let mut media = base_media(source_id, path, MediaKind::Container);
    media.mime = Some(
        match format {
            PlaylistFormat::M3u => "audio/x-mpegurl",
            PlaylistFormat::Pls => "audio/x-scpls",
        }
        .into(),
    );
    Some((media, true))
}
