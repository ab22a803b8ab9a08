use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A source-scoped media identifier.
///
/// Sources MUST treat this as an opaque, case-sensitive identifier that is
/// stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MediaId(pub String);

impl MediaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl AsRef<str> for MediaId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MediaId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for MediaId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for MediaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
    /// Browsable box: a directory, a playlist, a remote category.
    Container,
    Other,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        if mime == "inode/directory" {
            MediaKind::Container
        } else if mime.starts_with("audio/") {
            MediaKind::Audio
        } else if mime.starts_with("video/") {
            MediaKind::Video
        } else if mime.starts_with("image/") {
            MediaKind::Image
        } else {
            MediaKind::Other
        }
    }
}

/// Metadata for a single item returned by a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub id: MediaId,
    pub source_id: String,
    pub kind: MediaKind,
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    /// Duration in seconds when known.
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    /// Number of children for containers, when the source can count them.
    #[serde(default)]
    pub child_count: Option<u32>,
    /// Last modification time as unix seconds.
    #[serde(default)]
    pub modified: Option<u64>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl Media {
    pub fn new(
        id: impl Into<MediaId>,
        source_id: impl Into<String>,
        kind: MediaKind,
        title: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            kind,
            title: title.into(),
            url: None,
            mime: None,
            artist: None,
            album: None,
            genre: None,
            duration_seconds: None,
            child_count: None,
            modified: None,
            thumbnail: None,
        }
    }

    pub fn is_container(&self) -> bool {
        self.kind == MediaKind::Container
    }

    /// Fill any metadata this record lacks from another record of the same item.
    pub fn merge_missing(&mut self, other: &Media) {
        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }
        fill(&mut self.url, &other.url);
        fill(&mut self.mime, &other.mime);
        fill(&mut self.artist, &other.artist);
        fill(&mut self.album, &other.album);
        fill(&mut self.genre, &other.genre);
        fill(&mut self.duration_seconds, &other.duration_seconds);
        fill(&mut self.child_count, &other.child_count);
        fill(&mut self.modified, &other.modified);
        fill(&mut self.thumbnail, &other.thumbnail);
        if self.title.trim().is_empty() {
            self.title.clone_from(&other.title);
        }
    }
}

/// A single page of items plus how many more the source estimates it has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    #[serde(default)]
    pub remaining: Option<u32>,
}

impl<T> Page<T> {
    pub fn single_page(items: Vec<T>) -> Self {
        Self {
            items,
            remaining: Some(0),
        }
    }

    pub fn empty() -> Self {
        Self::single_page(Vec::new())
    }

    /// Slice `all` to the window `options` asks for and record what is left.
    pub fn from_window(all: Vec<T>, options: &OperationOptions) -> Self {
        let total = all.len();
        let window = options.window(total);
        let end = window.end;
        let items = all
            .into_iter()
            .skip(window.start)
            .take(window.len())
            .collect();
        Self {
            items,
            remaining: Some(u32::try_from(total - end).unwrap_or(u32::MAX)),
        }
    }
}

/// Media type filter. Containers and unclassified items are never filtered out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFilter {
    pub audio: bool,
    pub video: bool,
    pub image: bool,
}

impl TypeFilter {
    pub const ALL: TypeFilter = TypeFilter {
        audio: true,
        video: true,
        image: true,
    };

    pub const NONE: TypeFilter = TypeFilter {
        audio: false,
        video: false,
        image: false,
    };

    pub fn only(kind: MediaKind) -> Self {
        let mut filter = Self::NONE;
        match kind {
            MediaKind::Audio => filter.audio = true,
            MediaKind::Video => filter.video = true,
            MediaKind::Image => filter.image = true,
            MediaKind::Container | MediaKind::Other => return Self::ALL,
        }
        filter
    }

    pub fn allows(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
            MediaKind::Image => self.image,
            MediaKind::Container | MediaKind::Other => true,
        }
    }

    pub fn intersect(&self, other: &TypeFilter) -> TypeFilter {
        TypeFilter {
            audio: self.audio && other.audio,
            video: self.video && other.video,
            image: self.image && other.image,
        }
    }

    pub fn union(&self, other: &TypeFilter) -> TypeFilter {
        TypeFilter {
            audio: self.audio || other.audio,
            video: self.video || other.video,
            image: self.image || other.image,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.audio || self.video || self.image)
    }

    pub fn is_all(&self) -> bool {
        self.audio && self.video && self.image
    }
}

impl Default for TypeFilter {
    fn default() -> Self {
        Self::ALL
    }
}

/// How many results an operation should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Count {
    Limited(u32),
    Unlimited,
}

impl Count {
    pub fn is_zero(&self) -> bool {
        matches!(self, Count::Limited(0))
    }

    pub fn min(self, other: Count) -> Count {
        match (self, other) {
            (Count::Unlimited, other) => other,
            (this, Count::Unlimited) => this,
            (Count::Limited(a), Count::Limited(b)) => Count::Limited(a.min(b)),
        }
    }
}

impl Default for Count {
    fn default() -> Self {
        Count::Limited(10)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResolutionFlags {
    /// Ask the source to resolve every requested key, even slow ones.
    pub full: bool,
    /// Deliver results from an idle callback rather than inline.
    pub idle_relay: bool,
    /// Only return metadata that is cheap to obtain.
    pub fast_only: bool,
}

/// Options shared by every operation: paging, resolution flags and filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperationOptions {
    #[serde(default)]
    pub skip: u32,
    #[serde(default)]
    pub count: Count,
    #[serde(default)]
    pub flags: ResolutionFlags,
    #[serde(default)]
    pub type_filter: TypeFilter,
}

impl OperationOptions {
    pub fn first(count: u32) -> Self {
        Self {
            count: Count::Limited(count),
            ..Self::default()
        }
    }

    pub fn unlimited() -> Self {
        Self {
            count: Count::Unlimited,
            ..Self::default()
        }
    }

    pub fn with_skip(mut self, skip: u32) -> Self {
        self.skip = skip;
        self
    }

    pub fn with_flags(mut self, flags: ResolutionFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_type_filter(mut self, type_filter: TypeFilter) -> Self {
        self.type_filter = type_filter;
        self
    }

    /// The index range of a `len`-item result set these options select.
    pub fn window(&self, len: usize) -> Range<usize> {
        let start = (self.skip as usize).min(len);
        let end = match self.count {
            Count::Unlimited => len,
            Count::Limited(count) => start.saturating_add(count as usize).min(len),
        };
        start..end
    }

    /// Split these options into what `caps` can honour and what it cannot.
    ///
    /// The returned flag is `true` when nothing had to be dropped.
    pub fn obey_caps(&self, caps: &OperationCaps) -> (OperationOptions, OperationOptions, bool) {
        let mut supported = *self;
        let mut unsupported = OperationOptions {
            skip: 0,
            count: Count::Unlimited,
            flags: ResolutionFlags::default(),
            type_filter: TypeFilter::NONE,
        };
        let mut obeyed = true;

        supported.type_filter = self.type_filter.intersect(&caps.type_filter);
        if supported.type_filter != self.type_filter {
            unsupported.type_filter = TypeFilter {
                audio: self.type_filter.audio && !caps.type_filter.audio,
                video: self.type_filter.video && !caps.type_filter.video,
                image: self.type_filter.image && !caps.type_filter.image,
            };
            obeyed = false;
        }

        let capped = self.count.min(caps.max_count);
        if capped != self.count {
            supported.count = capped;
            unsupported.count = self.count;
            obeyed = false;
        }

        (supported, unsupported, obeyed)
    }
}

/// Limits a source advertises for one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCaps {
    pub type_filter: TypeFilter,
    pub max_count: Count,
}

impl Default for OperationCaps {
    fn default() -> Self {
        Self {
            type_filter: TypeFilter::ALL,
            max_count: Count::Unlimited,
        }
    }
}
