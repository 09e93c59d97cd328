//! In-memory fleet for tests.
//!
//! `MemoryShell` keeps a tiny filesystem and service state per node and
//! interprets the handful of shell commands the orchestrator issues:
//! `cd`, `mkdir -p`, `test -f`, `cp [-p]`, `mv -f`, `rm -f`, `chmod`,
//! `cat`, `sha256sum`, `ss -ltn`, `docker compose`, `haproxy -c -f` and
//! `systemctl reload`, chained with `&&`. Anything else exits 127.
//!
//! Faults are injected per node: unreachable, a number of dropped
//! connections, going offline after N calls, commands matching a substring
//! exiting 1, uploads failing, configs containing a marker failing
//! validation.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::TransportError;
use crate::shell::{CommandOutput, NodeEndpoint, RemoteShell};

#[derive(Debug, Default)]
struct FakeNode {
    files: BTreeMap<String, Vec<u8>>,
    modes: BTreeMap<String, u32>,
    listening: BTreeSet<u16>,
    listen_on_start: BTreeSet<u16>,
    failures: Vec<String>,
    invalid_markers: Vec<String>,
    uploads_fail: bool,
    unreachable: bool,
    dropped: u32,
    offline_after: Option<u32>,
    attempts: u32,
    log: Vec<String>,
    reloads: u32,
    restarts: u32,
    running: bool,
}

impl FakeNode {
    fn connect(&mut self) -> Result<(), TransportError> {
        self.attempts += 1;
        if let Some(remaining) = self.offline_after {
            if remaining == 0 {
                self.unreachable = true;
                self.offline_after = None;
            } else {
                self.offline_after = Some(remaining - 1);
            }
        }
        if self.unreachable {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        if self.dropped > 0 {
            self.dropped -= 1;
            return Err(TransportError::Connect("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn injected(&self, command: &str) -> Option<CommandOutput> {
        self.failures
            .iter()
            .any(|needle| command.contains(needle.as_str()))
            .then(|| CommandOutput::failed(1, format!("injected failure: {command}")))
    }

    fn run_script(&mut self, script: &str) -> CommandOutput {
        self.log.push(script.to_string());
        if let Some(out) = self.injected(script) {
            return out;
        }
        let mut stdout = String::new();
        for segment in script.split("&&") {
            let out = self.run_words(&tokenize(segment));
            stdout.push_str(&out.stdout);
            if !out.success() {
                return CommandOutput { stdout, ..out };
            }
        }
        CommandOutput::ok(stdout)
    }

    fn run_words(&mut self, words: &[String]) -> CommandOutput {
        let args: Vec<&str> = words.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["cd", _] | ["mkdir", "-p", ..] => CommandOutput::ok(""),
            ["test", "-f", path] => {
                if self.files.contains_key(*path) {
                    CommandOutput::ok("")
                } else {
                    CommandOutput::failed(1, "")
                }
            }
            ["cp", "-p", src, dst] | ["cp", src, dst] => match self.files.get(*src).cloned() {
                Some(bytes) => {
                    if let Some(mode) = self.modes.get(*src).copied() {
                        self.modes.insert(dst.to_string(), mode);
                    }
                    self.files.insert(dst.to_string(), bytes);
                    CommandOutput::ok("")
                }
                None => missing("cp", src),
            },
            ["mv", "-f", src, dst] => match self.files.remove(*src) {
                Some(bytes) => {
                    match self.modes.remove(*src) {
                        Some(mode) => self.modes.insert(dst.to_string(), mode),
                        None => self.modes.remove(*dst),
                    };
                    self.files.insert(dst.to_string(), bytes);
                    CommandOutput::ok("")
                }
                None => missing("mv", src),
            },
            ["rm", "-f", paths @ ..] => {
                for path in paths {
                    self.files.remove(*path);
                    self.modes.remove(*path);
                }
                CommandOutput::ok("")
            }
            ["chmod", mode, path] => {
                let Ok(mode) = u32::from_str_radix(mode, 8) else {
                    return CommandOutput::failed(1, format!("chmod: invalid mode: {mode}"));
                };
                if !self.files.contains_key(*path) {
                    return missing("chmod", path);
                }
                self.modes.insert(path.to_string(), mode);
                CommandOutput::ok("")
            }
            ["cat", path] => match self.files.get(*path) {
                Some(bytes) => CommandOutput::ok(String::from_utf8_lossy(bytes)),
                None => missing("cat", path),
            },
            ["sha256sum", path] => match self.files.get(*path) {
                Some(bytes) => {
                    CommandOutput::ok(format!("{}  {path}\n", hex::encode(Sha256::digest(bytes))))
                }
                None => missing("sha256sum", path),
            },
            ["ss", "-ltn"] => {
                let mut out = String::from("State  Recv-Q Send-Q Local Address:Port Peer Address:Port\n");
                for port in &self.listening {
                    out.push_str(&format!("LISTEN 0      4096   0.0.0.0:{port}     0.0.0.0:*\n"));
                }
                CommandOutput::ok(out)
            }
            ["docker", "compose", rest @ ..] => {
                if rest.contains(&"down") {
                    self.running = false;
                    for port in &self.listen_on_start {
                        self.listening.remove(port);
                    }
                } else if rest.contains(&"up") {
                    self.running = true;
                    self.restarts += 1;
                    self.listening.extend(self.listen_on_start.iter().copied());
                }
                CommandOutput::ok("")
            }
            ["haproxy", "-c", "-f", path] => match self.files.get(*path) {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(bytes);
                    match self.invalid_markers.iter().find(|m| text.contains(m.as_str())) {
                        Some(marker) => CommandOutput::failed(
                            1,
                            format!("[ALERT] parsing [{path}]: unknown keyword '{marker}'"),
                        ),
                        None => CommandOutput::ok("Configuration file is valid\n"),
                    }
                }
                None => missing("haproxy", path),
            },
            ["systemctl", "reload", _] => {
                self.reloads += 1;
                CommandOutput::ok("")
            }
            [] => CommandOutput::ok(""),
            [program, ..] => CommandOutput::failed(127, format!("{program}: command not found")),
        }
    }
}

fn missing(program: &str, path: &str) -> CommandOutput {
    CommandOutput::failed(1, format!("{program}: {path}: No such file or directory"))
}

/// Split a command segment into words, honouring single quotes and
/// backslash escapes.
fn tokenize(segment: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = segment.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

/// In-memory `RemoteShell`. Nodes spring into existence on first use.
#[derive(Debug, Default)]
pub struct MemoryShell {
    nodes: Mutex<HashMap<String, FakeNode>>,
}

impl MemoryShell {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_node<R>(&self, name: &str, f: impl FnOnce(&mut FakeNode) -> R) -> R {
        let mut nodes = self.lock();
        f(nodes.entry(name.to_string()).or_default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FakeNode>> {
        self.nodes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ── Fault injection ───────────────────────────────────────────

    pub fn set_unreachable(&self, node: &str, unreachable: bool) {
        self.with_node(node, |n| n.unreachable = unreachable);
    }

    /// Fail the next `count` connection attempts, then recover.
    pub fn drop_connections(&self, node: &str, count: u32) {
        self.with_node(node, |n| n.dropped = count);
    }

    /// Allow `calls` more connections, then become unreachable.
    pub fn go_offline_after(&self, node: &str, calls: u32) {
        self.with_node(node, |n| n.offline_after = Some(calls));
    }

    /// Commands containing `needle` exit 1 without side effects.
    pub fn fail_on(&self, node: &str, needle: &str) {
        self.with_node(node, |n| n.failures.push(needle.to_string()));
    }

    pub fn clear_failures(&self, node: &str) {
        self.with_node(node, |n| n.failures.clear());
    }

    pub fn fail_uploads(&self, node: &str, fail: bool) {
        self.with_node(node, |n| n.uploads_fail = fail);
    }

    /// `haproxy -c` rejects any config containing `marker`.
    pub fn reject_config_containing(&self, node: &str, marker: &str) {
        self.with_node(node, |n| n.invalid_markers.push(marker.to_string()));
    }

    // ── State ─────────────────────────────────────────────────────

    pub fn put_file(&self, node: &str, path: &str, contents: &[u8]) {
        self.with_node(node, |n| {
            n.files.insert(path.to_string(), contents.to_vec());
        });
    }

    pub fn file(&self, node: &str, path: &str) -> Option<Vec<u8>> {
        self.with_node(node, |n| n.files.get(path).cloned())
    }

    pub fn file_string(&self, node: &str, path: &str) -> Option<String> {
        self.file(node, path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Paths currently present on the node.
    pub fn paths(&self, node: &str) -> Vec<String> {
        self.with_node(node, |n| n.files.keys().cloned().collect())
    }

    pub fn mode(&self, node: &str, path: &str) -> Option<u32> {
        self.with_node(node, |n| n.modes.get(path).copied())
    }

    pub fn set_listening(&self, node: &str, port: u16, listening: bool) {
        self.with_node(node, |n| {
            if listening {
                n.listening.insert(port);
            } else {
                n.listening.remove(&port);
            }
        });
    }

    /// Start listening on `port` whenever the service is (re)started.
    pub fn listen_on_start(&self, node: &str, port: u16) {
        self.with_node(node, |n| {
            n.listen_on_start.insert(port);
        });
    }

    pub fn commands(&self, node: &str) -> Vec<String> {
        self.with_node(node, |n| n.log.clone())
    }

    pub fn connection_attempts(&self, node: &str) -> u32 {
        self.with_node(node, |n| n.attempts)
    }

    pub fn reloads(&self, node: &str) -> u32 {
        self.with_node(node, |n| n.reloads)
    }

    pub fn restarts(&self, node: &str) -> u32 {
        self.with_node(node, |n| n.restarts)
    }

    pub fn is_running(&self, node: &str) -> bool {
        self.with_node(node, |n| n.running)
    }
}

#[async_trait]
impl RemoteShell for MemoryShell {
    async fn run(
        &self,
        node: &NodeEndpoint,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        self.with_node(&node.name, |n| {
            n.connect()?;
            Ok(n.run_script(command))
        })
    }

    async fn upload(
        &self,
        node: &NodeEndpoint,
        local: &Path,
        remote: &str,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let contents = std::fs::read(local).map_err(|e| TransportError::Spawn {
            program: "scp".to_string(),
            reason: e.to_string(),
        })?;
        self.with_node(&node.name, |n| {
            n.connect()?;
            n.log.push(format!("upload {remote}"));
            if n.uploads_fail {
                return Ok(CommandOutput::failed(1, format!("scp: {remote}: Permission denied")));
            }
            n.files.insert(remote.to_string(), contents);
            n.modes.remove(remote);
            Ok(CommandOutput::ok(""))
        })
    }

    async fn download(
        &self,
        node: &NodeEndpoint,
        remote: &str,
        local: &Path,
        _timeout: Duration,
    ) -> Result<CommandOutput, TransportError> {
        let contents = self.with_node(&node.name, |n| {
            n.connect()?;
            n.log.push(format!("download {remote}"));
            Ok::<_, TransportError>(n.files.get(remote).cloned())
        })?;
        match contents {
            Some(bytes) => {
                std::fs::write(local, bytes).map_err(|e| TransportError::Spawn {
                    program: "scp".to_string(),
                    reason: e.to_string(),
                })?;
                Ok(CommandOutput::ok(""))
            }
            None => Ok(missing("scp", remote)),
        }
    }
}
