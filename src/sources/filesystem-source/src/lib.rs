//! Local library source: directories, media files and playlists under one or
//! more roots.

mod scan;
mod tags;

use medley_core::config::SourceEntry;
use medley_core::models::{Media, MediaId, OperationOptions, Page};
use medley_core::source::{Source, SourceCapabilities, SourceError, SourceResult};
use scan::{scan_library, LibraryIndex};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

#[derive(Clone, Debug)]
pub struct FilesystemSource {
    id: String,
    name: String,
    roots: Vec<PathBuf>,
    index: Arc<RwLock<LibraryIndex>>,
}

impl FilesystemSource {
    /// Scan `roots` and build the source. Fails if any root is missing.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        roots: Vec<PathBuf>,
    ) -> SourceResult<Self> {
        let id = id.into();
        let index = scan_library(&id, &roots)?;
        Ok(Self {
            id,
            name: name.into(),
            roots,
            index: Arc::new(RwLock::new(index)),
        })
    }

    /// Build from a `kind = "filesystem"` configuration entry.
    pub fn from_entry(id: &str, entry: &SourceEntry) -> SourceResult<Self> {
        Self::new(id, entry.display_name(id), entry.roots.clone())
    }

    /// Walk the roots again, replacing the index. Returns the number of items.
    pub fn rescan(&self) -> SourceResult<usize> {
        let index = scan_library(&self.id, &self.roots)?;
        let count = index.items.len();
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(count)
    }

    fn index(&self) -> RwLockReadGuard<'_, LibraryIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl Source for FilesystemSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> SourceCapabilities {
        SourceCapabilities::all()
    }

    fn is_available(&self) -> bool {
        self.roots.iter().all(|root| root.is_dir())
    }

    async fn search(&self, query: &str, options: &OperationOptions) -> SourceResult<Page<Media>> {
        let hits = self.index().search(query, &options.type_filter);
        Ok(Page::from_window(hits, options))
    }

    async fn browse(
        &self,
        container: Option<&MediaId>,
        options: &OperationOptions,
    ) -> SourceResult<Page<Media>> {
        let Some(container) = container else {
            let children = self.index().children(None, &options.type_filter);
            return Ok(Page::from_window(children, options));
        };

        let playlist_path = {
            let index = self.index();
            let item = index.get(container).ok_or_else(|| SourceError::NotFound {
                entity: container.to_string(),
            })?;
            if !item.media.is_container() {
                return Err(SourceError::Other {
                    message: format!("{container} is not a container"),
                });
            }
            if !item.playlist {
                let children = index.children(Some(container), &options.type_filter);
                return Ok(Page::from_window(children, options));
            }
            item.path.clone()
        };

        let mut entries = self
            .index()
            .expand_playlist(&self.id, &playlist_path)
            .map_err(|e| SourceError::Other {
                message: e.to_string(),
            })?;
        entries.retain(|m| options.type_filter.allows(m.kind));
        Ok(Page::from_window(entries, options))
    }

    async fn refresh(&self) -> SourceResult<()> {
        let items = self.rescan()?;
        tracing::debug!(source_id = %self.id, items, "library rescanned");
        Ok(())
    }

    async fn resolve(&self, id: &MediaId) -> SourceResult<Media> {
        self.index()
            .get(id)
            .map(|item| item.media.clone())
            .ok_or_else(|| SourceError::NotFound {
                entity: id.to_string(),
            })
    }
}
