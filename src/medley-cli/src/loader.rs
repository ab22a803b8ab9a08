use filesystem_source::FilesystemSource;
use medley_core::{Source, SourceEntry, SourceError, SourceKind, SourceLoader};
use medley_plugin::{ExecPluginSource, PluginConfig};
use std::sync::Arc;

/// Builds sources from `[sources.<id>]` configuration entries.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredLoader;

impl SourceLoader for ConfiguredLoader {
    fn load(&self, id: &str, entry: &SourceEntry) -> Result<Arc<dyn Source>, SourceError> {
        match entry.kind {
            SourceKind::Filesystem => Ok(Arc::new(FilesystemSource::from_entry(id, entry)?)),
            SourceKind::Plugin => {
                let config = PluginConfig::from_entry(entry).ok_or_else(|| SourceError::Other {
                    message: format!("plugin source '{id}' has no executable"),
                })?;
                let source =
                    ExecPluginSource::start(config, Some(id.to_string()), entry.name.clone())
                        .map_err(|err| SourceError::Other {
                            message: err.to_string(),
                        })?;
                Ok(Arc::new(source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn loads_filesystem_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song.mp3"), "fake").unwrap();
        let mut entry = SourceEntry::filesystem(vec![dir.path().to_path_buf()]);
        entry.name = Some("Music".into());

        let source = ConfiguredLoader.load("music", &entry).unwrap();
        assert_eq!(source.id(), "music");
        assert_eq!(source.name(), "Music");
        assert!(source.capabilities().search);
    }

    #[test]
    fn missing_roots_fail_to_load() {
        let entry = SourceEntry::filesystem(vec!["/definitely/not/here".into()]);
        assert!(matches!(
            ConfiguredLoader.load("music", &entry),
            Err(SourceError::NotFound { .. })
        ));
    }

    #[test]
    fn unstartable_plugin_is_reported() {
        let entry = SourceEntry::plugin("/definitely/not/a/plugin");
        match ConfiguredLoader.load("radio", &entry) {
            Err(SourceError::Other { message }) => assert!(message.contains("plugin")),
            Err(other) => panic!("expected Other, got {other:?}"),
            Ok(_) => panic!("plugin should not start"),
        }
    }
}
