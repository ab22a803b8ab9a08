use lofty::{Accessor, AudioFile, ItemKey, Probe, TaggedFileExt};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTags {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub duration_seconds: Option<u32>,
}

/// Read embedded tags. Unreadable or untagged files yield empty tags.
pub fn parse_tags(path: &Path) -> ParsedTags {
    let tagged = match Probe::open(path).and_then(|p| p.read()) {
        Ok(tagged) => tagged,
        Err(err) => {
            tracing::trace!(path = %path.display(), error = %err, "no readable tags");
            return ParsedTags::default();
        }
    };

    let tag = tagged.primary_tag().or_else(|| tagged.first_tag());
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };

    let title = tag.and_then(|t| t.get_string(&ItemKey::TrackTitle).and_then(non_empty));
    let artist = tag.and_then(|t| t.artist().and_then(|s| non_empty(&s)));
    let album = tag.and_then(|t| t.album().and_then(|s| non_empty(&s)));
    let genre = tag.and_then(|t| t.genre().and_then(|s| non_empty(&s)));
    let seconds = tagged.properties().duration().as_secs();
    let duration_seconds = (seconds > 0).then(|| u32::try_from(seconds).unwrap_or(u32::MAX));

    ParsedTags {
        title,
        artist,
        album,
        genre,
        duration_seconds,
    }
}
