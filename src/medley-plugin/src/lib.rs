//! External plugin sources for Medley.
//!
//! A plugin is any executable that speaks the JSON-lines protocol in
//! [`protocol`] on stdin/stdout:
//! - Medley writes one [`PluginRequest`] per line to the plugin's stdin
//! - the plugin answers each with exactly one [`PluginResponse`] line
//!
//! # Example plugin (pseudocode)
//!
//! ```text
//! while (line = read_stdin()):
//!     request = json_parse(line)
//!     if request.method.type == "Initialize":
//!         result = {"status": "Initialized", "id": "radio", "name": "Radio",
//!                   "version": "1.0.0", "protocol_version": 1}
//!     elif request.method.type == "Search":
//!         result = {"status": "Media", "items": [...], "remaining": 0}
//!     write_stdout(json_stringify({"id": request.id, "result": result}) + "\n")
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use medley_plugin::{ExecPluginSource, PluginConfig};
//!
//! let config = PluginConfig {
//!     executable: "/usr/lib/medley/radio-plugin".into(),
//!     ..PluginConfig::default()
//! };
//! let source = ExecPluginSource::start(config, Some("radio".into()), None)?;
//! // source implements medley_core::Source
//! ```

mod adapter;
mod host;
pub mod protocol;

pub use adapter::ExecPluginSource;
pub use host::{ExecPluginHost, PluginConfig, PluginHostError};
pub use protocol::{
    PluginError, PluginErrorKind, PluginInfo, PluginMethod, PluginRequest, PluginResponse,
    PluginResult, PROTOCOL_VERSION,
};

use medley_core::config::SourceEntry;

impl PluginConfig {
    /// Launch settings for a `kind = "plugin"` configuration entry.
    pub fn from_entry(entry: &SourceEntry) -> Option<Self> {
        Some(Self {
            executable: entry.executable.clone()?,
            args: entry.args.clone(),
            working_dir: entry.working_dir.clone(),
            env: entry.env.clone(),
            ..Self::default()
        })
    }
}
