//! Exec-based plugin host that talks JSON lines to a child process over stdio.
//!
//! A reader thread owns the plugin's stdout and routes each response to the
//! request with the same id. Callers never hold a lock while waiting, so a
//! request that is abandoned (timed out or its future dropped) does not block
//! later ones; its late response is discarded.

use crate::protocol::{
    PluginError, PluginInfo, PluginMethod, PluginRequest, PluginResponse, PluginResult,
    PROTOCOL_VERSION,
};
use medley_core::redact::{redact_args, redact_env};
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::oneshot;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const EXIT_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("failed to spawn plugin process {executable}: {source}")]
    SpawnFailed {
        executable: PathBuf,
        source: std::io::Error,
    },
    #[error("plugin process has no stdin")]
    NoStdin,
    #[error("plugin process has no stdout")]
    NoStdout,
    #[error("failed to write to plugin: {0}")]
    WriteError(std::io::Error),
    #[error("failed to read from plugin: {0}")]
    ReadError(std::io::Error),
    #[error("failed to encode plugin request: {0}")]
    ParseError(serde_json::Error),
    #[error("plugin returned error: {0}")]
    Plugin(PluginError),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },
    #[error("unexpected response to {method}")]
    UnexpectedResponse { method: &'static str },
    #[error("plugin did not answer {method} within {millis}ms")]
    Timeout { method: &'static str, millis: u64 },
    #[error("plugin process terminated unexpectedly")]
    ProcessTerminated,
}

/// How to launch an external plugin.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Upper bound on any single request, the handshake included.
    pub request_timeout: Duration,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::new(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

enum Reply {
    Blocking(mpsc::Sender<PluginResponse>),
    Async(oneshot::Sender<PluginResponse>),
}

impl Reply {
    fn deliver(self, response: PluginResponse) {
        // The waiter may have given up already.
        let _ = match self {
            Reply::Blocking(tx) => tx.send(response).map_err(drop),
            Reply::Async(tx) => tx.send(response).map_err(drop),
        };
    }
}

/// One running plugin process: its stdin and the requests awaiting answers.
struct Session {
    stdin: Mutex<Option<ChildStdin>>,
    pending: Mutex<HashMap<u64, Reply>>,
    connected: AtomicBool,
}

impl Session {
    fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Mutex::new(Some(stdin)),
            pending: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register `reply` under `id` and write the request line.
    fn dispatch(&self, id: u64, line: &str, reply: Reply) -> Result<(), PluginHostError> {
        {
            let mut pending = lock(&self.pending);
            if !self.is_connected() {
                return Err(PluginHostError::ProcessTerminated);
            }
            pending.insert(id, reply);
        }
        let written = match lock(&self.stdin).as_mut() {
            Some(stdin) => writeln!(stdin, "{line}")
                .and_then(|()| stdin.flush())
                .map_err(PluginHostError::WriteError),
            None => Err(PluginHostError::ProcessTerminated),
        };
        if written.is_err() {
            self.abandon(id);
        }
        written
    }

    fn abandon(&self, id: u64) {
        lock(&self.pending).remove(&id);
    }

    /// Disconnect: close stdin and fail every waiting request.
    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *lock(&self.stdin) = None;
        lock(&self.pending).clear();
    }

    fn read_responses(&self, stdout: ChildStdout) {
        for line in BufReader::new(stdout).lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to read from plugin");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response: PluginResponse = match serde_json::from_str(&line) {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring unparseable plugin output");
                    continue;
                }
            };
            let reply = lock(&self.pending).remove(&response.id);
            match reply {
                Some(reply) => reply.deliver(response),
                None => tracing::debug!(
                    request_id = response.id,
                    "discarding response to an abandoned request"
                ),
            }
        }
        self.close();
    }
}

/// Drops the pending entry if the awaiting future is cancelled.
struct AbandonGuard<'a> {
    session: &'a Session,
    id: u64,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        self.session.abandon(self.id);
    }
}

/// Host for one external plugin process.
pub struct ExecPluginHost {
    config: PluginConfig,
    child: Mutex<Option<Child>>,
    session: Mutex<Option<Arc<Session>>>,
    request_id: AtomicU64,
    info: Mutex<Option<PluginInfo>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_result(response: PluginResponse) -> Result<PluginResult, PluginHostError> {
    match response.result {
        PluginResult::Error(err) => Err(PluginHostError::Plugin(err)),
        result => Ok(result),
    }
}

impl ExecPluginHost {
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            child: Mutex::new(None),
            session: Mutex::new(None),
            request_id: AtomicU64::new(1),
            info: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Spawn the plugin process and perform the handshake.
    pub fn start(&self) -> Result<PluginInfo, PluginHostError> {
        tracing::debug!(
            executable = %self.config.executable.display(),
            args = ?redact_args(&self.config.args),
            env = ?redact_env(&self.config.env),
            "starting plugin"
        );

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| PluginHostError::SpawnFailed {
            executable: self.config.executable.clone(),
            source,
        })?;
        let stdin = child.stdin.take().ok_or(PluginHostError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(PluginHostError::NoStdout)?;

        let session = Arc::new(Session::new(stdin));
        let reader = Arc::clone(&session);
        let spawned = std::thread::Builder::new()
            .name("medley-plugin-reader".into())
            .spawn(move || reader.read_responses(stdout));
        *lock(&self.child) = Some(child);
        if let Err(err) = spawned {
            self.kill();
            return Err(PluginHostError::ReadError(err));
        }
        *lock(&self.session) = Some(session);

        match self.initialize() {
            Ok(info) => {
                *lock(&self.info) = Some(info.clone());
                Ok(info)
            }
            Err(err) => {
                self.kill();
                Err(err)
            }
        }
    }

    /// Ask the plugin to shut down, then kill it if it has not exited
    /// within a short grace period.
    pub fn stop(&self) {
        if let Some(session) = self.session() {
            if session.is_connected() {
                match self.request_within(PluginMethod::Shutdown, SHUTDOWN_GRACE) {
                    Ok(PluginResult::ShutdownAck) => {}
                    _ => tracing::debug!(
                        executable = %self.config.executable.display(),
                        "plugin did not acknowledge shutdown"
                    ),
                }
            }
            // Closing stdin lets well-behaved plugins see EOF.
            session.close();
        }
        *lock(&self.session) = None;

        if let Some(mut child) = lock(&self.child).take() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => std::thread::sleep(EXIT_POLL),
                    _ => {
                        let _ = child.kill();
                        let _ = child.wait();
                        break;
                    }
                }
            }
        }
        *lock(&self.info) = None;
    }

    fn kill(&self) {
        if let Some(session) = lock(&self.session).take() {
            session.close();
        }
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Whether the plugin process is still alive and its stdout still open.
    pub fn is_running(&self) -> bool {
        let connected = self.session().is_some_and(|s| s.is_connected());
        connected
            && lock(&self.child)
                .as_mut()
                .is_some_and(|c| matches!(c.try_wait(), Ok(None)))
    }

    /// Handshake info; `None` before `start` or after `stop`.
    pub fn info(&self) -> Option<PluginInfo> {
        lock(&self.info).clone()
    }

    fn encode(&self, method: PluginMethod) -> Result<(u64, String), PluginHostError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let line = serde_json::to_string(&PluginRequest { id, method })
            .map_err(PluginHostError::ParseError)?;
        Ok((id, line))
    }

    /// Send one request and block until its response, or until the
    /// configured request timeout.
    ///
    /// An `Error` result from the plugin is returned as [`PluginHostError::Plugin`].
    pub fn send_request(&self, method: PluginMethod) -> Result<PluginResult, PluginHostError> {
        self.request_within(method, self.config.request_timeout)
    }

    fn request_within(
        &self,
        method: PluginMethod,
        timeout: Duration,
    ) -> Result<PluginResult, PluginHostError> {
        let session = self.session().ok_or(PluginHostError::ProcessTerminated)?;
        let method_name = method.name();
        let (id, line) = self.encode(method)?;
        let (tx, rx) = mpsc::channel();
        session.dispatch(id, &line, Reply::Blocking(tx))?;

        match rx.recv_timeout(timeout) {
            Ok(response) => {
                tracing::trace!(request_id = id, method = method_name, "plugin responded");
                into_result(response)
            }
            Err(RecvTimeoutError::Timeout) => {
                session.abandon(id);
                Err(PluginHostError::Timeout {
                    method: method_name,
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PluginHostError::ProcessTerminated),
        }
    }

    /// Send one request and await its response without blocking a thread.
    ///
    /// Dropping the returned future abandons the request; the plugin's late
    /// answer is discarded and later requests are unaffected.
    pub async fn request(&self, method: PluginMethod) -> Result<PluginResult, PluginHostError> {
        let session = self.session().ok_or(PluginHostError::ProcessTerminated)?;
        let method_name = method.name();
        let (id, line) = self.encode(method)?;
        let (tx, rx) = oneshot::channel();
        session.dispatch(id, &line, Reply::Async(tx))?;
        let _guard = AbandonGuard {
            session: &session,
            id,
        };

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(response)) => {
                tracing::trace!(request_id = id, method = method_name, "plugin responded");
                into_result(response)
            }
            Ok(Err(_closed)) => Err(PluginHostError::ProcessTerminated),
            Err(_elapsed) => Err(PluginHostError::Timeout {
                method: method_name,
                millis: u64::try_from(self.config.request_timeout.as_millis())
                    .unwrap_or(u64::MAX),
            }),
        }
    }

    fn initialize(&self) -> Result<PluginInfo, PluginHostError> {
        match self.send_request(PluginMethod::Initialize)? {
            PluginResult::Initialized(info) => {
                if info.protocol_version != PROTOCOL_VERSION {
                    return Err(PluginHostError::ProtocolMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: info.protocol_version,
                    });
                }
                tracing::info!(
                    plugin_id = %info.id,
                    plugin_name = %info.name,
                    plugin_version = %info.version,
                    "plugin initialized"
                );
                Ok(info)
            }
            _ => Err(PluginHostError::UnexpectedResponse {
                method: "Initialize",
            }),
        }
    }
}

impl Drop for ExecPluginHost {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Write a bash script that answers requests with `body`.
    ///
    /// `body` sees `$id` and `$method` for each request line. The script is
    /// run through `bash` rather than executed directly, which avoids
    /// ETXTBSY races with other tests forking.
    pub(crate) fn fixture_plugin(body: &str) -> tempfile::TempPath {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"#!/bin/bash
while IFS= read -r line; do
    id=$(echo "$line" | grep -o '"id":[0-9]*' | head -n1 | cut -d: -f2)
    method=$(echo "$line" | grep -o '"type":"[A-Za-z]*"' | head -n1 | cut -d'"' -f4)
{body}
done
"#
        )
        .unwrap();
        file.flush().unwrap();
        file.into_temp_path()
    }

    pub(crate) fn fixture_config(script: &tempfile::TempPath) -> PluginConfig {
        PluginConfig {
            executable: PathBuf::from("bash"),
            args: vec![script.to_string_lossy().into_owned()],
            ..PluginConfig::default()
        }
    }

    pub(crate) const HANDSHAKE: &str = r#"    case "$method" in
        Initialize) echo '{"id":'$id',"result":{"status":"Initialized","id":"test","name":"Test","version":"1.0.0","protocol_version":1}}' ;;
        Shutdown) echo '{"id":'$id',"result":{"status":"ShutdownAck"}}'; exit 0 ;;
        *) echo '{"id":'$id',"result":{"status":"Error","kind":"not_supported","message":"'$method'"}}' ;;
    esac"#;

    #[test]
    fn handshake_and_graceful_stop() {
        let script = fixture_plugin(HANDSHAKE);
        let host = ExecPluginHost::new(fixture_config(&script));
        let info = host.start().expect("failed to start plugin");

        assert_eq!(info.id, "test");
        assert_eq!(info.version, "1.0.0");
        assert!(host.is_running());
        assert_eq!(host.info(), Some(info));

        host.stop();
        assert!(!host.is_running());
        assert!(host.info().is_none());
    }

    #[test]
    fn plugin_errors_carry_their_kind() {
        let script = fixture_plugin(HANDSHAKE);
        let host = ExecPluginHost::new(fixture_config(&script));
        host.start().unwrap();

        let err = host.send_request(PluginMethod::Capabilities).unwrap_err();
        match err {
            PluginHostError::Plugin(err) => {
                assert_eq!(err.kind, crate::protocol::PluginErrorKind::NotSupported);
                assert_eq!(err.message, "Capabilities");
            }
            other => panic!("expected plugin error, got {other:?}"),
        }
    }

    #[test]
    fn protocol_mismatch_rejected() {
        let script = fixture_plugin(
            r#"    echo '{"id":'$id',"result":{"status":"Initialized","id":"old","name":"Old","version":"0.1.0","protocol_version":99}}'"#,
        );
        let host = ExecPluginHost::new(fixture_config(&script));
        let err = host.start().unwrap_err();
        assert!(matches!(
            err,
            PluginHostError::ProtocolMismatch {
                expected: PROTOCOL_VERSION,
                actual: 99
            }
        ));
        assert!(!host.is_running());
    }

    #[test]
    fn stray_output_is_ignored() {
        let body = format!(
            "    echo 'not json'\n    echo '{{\"id\":424242,\"result\":{{\"status\":\"ShutdownAck\"}}}}'\n{HANDSHAKE}"
        );
        let script = fixture_plugin(&body);
        let host = ExecPluginHost::new(fixture_config(&script));
        let info = host.start().expect("stray lines must not break the handshake");
        assert_eq!(info.id, "test");
    }

    pub(crate) const SLOW_SEARCH: &str = r#"    case "$method" in
        Initialize) echo '{"id":'$id',"result":{"status":"Initialized","id":"slow","name":"Slow","version":"1.0.0","protocol_version":1}}' ;;
        Capabilities) echo '{"id":'$id',"result":{"status":"Capabilities","search":true,"browse":false,"resolve":false}}' ;;
        Search) sleep 3; echo '{"id":'$id',"result":{"status":"Media","items":[]}}' ;;
        Shutdown) echo '{"id":'$id',"result":{"status":"ShutdownAck"}}'; exit 0 ;;
    esac"#;

    fn search() -> PluginMethod {
        PluginMethod::Search {
            query: "x".into(),
            options: medley_core::models::OperationOptions::first(1),
        }
    }

    #[test]
    fn blocking_request_times_out() {
        let script = fixture_plugin(SLOW_SEARCH);
        let host = ExecPluginHost::new(PluginConfig {
            request_timeout: Duration::from_millis(500),
            ..fixture_config(&script)
        });
        host.start().unwrap();

        let started = Instant::now();
        let err = host.send_request(search()).unwrap_err();
        assert!(matches!(
            err,
            PluginHostError::Timeout {
                method: "Search",
                millis: 500
            }
        ));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn abandoned_request_does_not_block_the_next() {
        let script = fixture_plugin(SLOW_SEARCH);
        let host = ExecPluginHost::new(fixture_config(&script));
        host.start().unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), host.request(search())).await;
        assert!(abandoned.is_err());

        // The late Search answer is dropped; Capabilities gets its own reply.
        match host.request(PluginMethod::Capabilities).await.unwrap() {
            PluginResult::Capabilities(caps) => assert!(caps.search),
            other => panic!("expected capabilities, got {other:?}"),
        }
    }

    #[test]
    fn stop_does_not_wait_for_a_busy_plugin() {
        let script = fixture_plugin(SLOW_SEARCH);
        let host = ExecPluginHost::new(PluginConfig {
            request_timeout: Duration::from_millis(500),
            ..fixture_config(&script)
        });
        host.start().unwrap();
        assert!(host.send_request(search()).is_err());

        let started = Instant::now();
        host.stop();
        assert!(!host.is_running());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn exited_plugin_reports_terminated() {
        let script = fixture_plugin(
            r#"    case "$method" in
        Initialize) echo '{"id":'$id',"result":{"status":"Initialized","id":"t","name":"T","version":"1","protocol_version":1}}' ;;
        *) exit 0 ;;
    esac"#,
        );
        let host = ExecPluginHost::new(fixture_config(&script));
        host.start().unwrap();

        let err = host.send_request(PluginMethod::Capabilities).unwrap_err();
        assert!(matches!(err, PluginHostError::ProcessTerminated));
        // Subsequent requests fail fast without touching the dead pipe.
        assert!(matches!(
            host.send_request(PluginMethod::Capabilities),
            Err(PluginHostError::ProcessTerminated)
        ));
    }

    #[test]
    fn missing_executable_fails_to_spawn() {
        let host = ExecPluginHost::new(PluginConfig {
            executable: PathBuf::from("/nonexistent/medley-plugin"),
            ..PluginConfig::default()
        });
        assert!(matches!(
            host.start(),
            Err(PluginHostError::SpawnFailed { .. })
        ));
    }
}
