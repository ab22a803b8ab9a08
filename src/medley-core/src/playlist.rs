//! M3U and PLS playlist support.
//!
//! Sources expose playlists as containers; browsing one expands its entries.
//! Only local entries (plain paths and `file://` URIs) can be resolved, other
//! schemes are reported and skipped by callers.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

const SNIFF_BYTES: u64 = 512;

const PLAYLIST_MIME_PREFIXES: &[&str] = &[
    "audio/x-ms-asx",
    "audio/mpegurl",
    "audio/x-mpegurl",
    "audio/x-scpls",
];

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("failed to read playlist {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path} is not a recognised playlist")]
    UnknownFormat { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaylistFormat {
    M3u,
    Pls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistEntry {
    /// Location as written in the playlist, resolved against the playlist's
    /// directory when relative.
    pub uri: String,
    pub title: Option<String>,
    pub duration_seconds: Option<u32>,
}

/// Cheap check on a mime type; does not look at content.
pub fn mime_is_playlist(mime: &str) -> bool {
    PLAYLIST_MIME_PREFIXES
        .iter()
        .any(|prefix| mime.starts_with(prefix))
}

/// Detect a playlist by extension, falling back to sniffing the first bytes.
pub fn path_is_playlist(path: &Path) -> bool {
    detect_format(path).is_some()
}

pub fn detect_format(path: &Path) -> Option<PlaylistFormat> {
    let by_extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
            "m3u" | "m3u8" => Some(PlaylistFormat::M3u),
            "pls" => Some(PlaylistFormat::Pls),
            _ => None,
        });
    by_extension.or_else(|| sniff(path))
}

fn sniff(path: &Path) -> Option<PlaylistFormat> {
    let file = fs::File::open(path).ok()?;
    let mut head = Vec::new();
    file.take(SNIFF_BYTES).read_to_end(&mut head).ok()?;
    let text = String::from_utf8_lossy(&head);
    let text = text.trim_start_matches('\u{feff}').trim_start();
    if text.starts_with("#EXTM3U") {
        Some(PlaylistFormat::M3u)
    } else if text
        .get(..10)
        .is_some_and(|h| h.eq_ignore_ascii_case("[playlist]"))
    {
        Some(PlaylistFormat::Pls)
    } else {
        None
    }
}

/// Read and parse a playlist file.
pub fn parse_playlist(path: &Path) -> Result<Vec<PlaylistEntry>, PlaylistError> {
    let format = detect_format(path).ok_or_else(|| PlaylistError::UnknownFormat {
        path: path.to_path_buf(),
    })?;
    let bytes = fs::read(path).map_err(|source| PlaylistError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let mut entries = match format {
        PlaylistFormat::M3u => parse_m3u(&text),
        PlaylistFormat::Pls => parse_pls(&text),
    };
    if let Some(base) = path.parent() {
        for entry in &mut entries {
            entry.uri = resolve_relative(&entry.uri, base);
        }
    }
    Ok(entries)
}

/// Parse (extended) M3U text. `#EXTINF` metadata applies to the next location.
pub fn parse_m3u(text: &str) -> Vec<PlaylistEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(Option<u32>, Option<String>)> = None;

    for line in text.lines() {
        let line = line.trim().trim_start_matches('\u{feff}');
        if line.is_empty() {
            continue;
        }
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let (duration, title) = info.split_once(',').unwrap_or((info, ""));
            let title = title.trim();
            pending = Some((
                parse_duration(duration),
                (!title.is_empty()).then(|| title.to_string()),
            ));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let (duration_seconds, title) = pending.take().unwrap_or((None, None));
        entries.push(PlaylistEntry {
            uri: line.to_string(),
            title,
            duration_seconds,
        });
    }
    entries
}

/// Parse PLS text (`FileN=`, `TitleN=`, `LengthN=`), ordered by entry number.
pub fn parse_pls(text: &str) -> Vec<PlaylistEntry> {
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Partial {
        file: Option<String>,
        title: Option<String>,
        length: Option<u32>,
    }

    let mut partials: BTreeMap<u32, Partial> = BTreeMap::new();
    for line in text.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        let split = key.find(|c: char| c.is_ascii_digit());
        let Some((field, number)) = split.map(|at| key.split_at(at)) else {
            continue;
        };
        let Ok(number) = number.parse::<u32>() else {
            continue;
        };
        let partial = partials.entry(number).or_default();
        match field {
            "file" => partial.file = Some(value.to_string()),
            "title" if !value.is_empty() => partial.title = Some(value.to_string()),
            "length" => partial.length = parse_duration(value),
            _ => {}
        }
    }

    partials
        .into_values()
        .filter_map(|p| {
            Some(PlaylistEntry {
                uri: p.file.filter(|f| !f.is_empty())?,
                title: p.title,
                duration_seconds: p.length,
            })
        })
        .collect()
}

fn parse_duration(raw: &str) -> Option<u32> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    (seconds > 0.0).then(|| seconds.round() as u32)
}

fn has_scheme(uri: &str) -> bool {
    match uri.split_once(':') {
        // Require more than one character so `C:\music` stays a path.
        Some((scheme, _)) => {
            scheme.len() > 1
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn resolve_relative(uri: &str, base: &Path) -> String {
    if has_scheme(uri) || Path::new(uri).is_absolute() {
        return uri.to_string();
    }
    base.join(uri).to_string_lossy().into_owned()
}

/// Local path for an entry location, or `None` for non-local schemes.
pub fn entry_path(uri: &str) -> Option<PathBuf> {
    if !has_scheme(uri) {
        return Some(PathBuf::from(uri));
    }
    let url = Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}
