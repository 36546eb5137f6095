//! Shared fakes for the integration tests.
//!
//! Only the public [`Executor`] and [`HostIo`] seams are used, so these tests
//! see the library exactly as an embedding orchestrator does.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use volume_connector::{
    CommandSpec, ConnectorConfig, ConnectorFactory, ExecError, ExecOutput, Executor, HostIo,
};

tokio::task_local! {
    pub static CALLER: &'static str;
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Link(PathBuf),
}

/// Map-backed host. Entries may stay hidden for their first few probes.
#[derive(Debug, Default)]
pub struct MemHost {
    entries: Mutex<HashMap<PathBuf, (Node, u32)>>,
    probes: Mutex<HashMap<PathBuf, u32>>,
}

impl MemHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn file(&self, path: &str, contents: &str) -> &Self {
        self.insert(path, Node::File(contents.to_string()), 0)
    }

    pub fn link(&self, path: &str, target: &str) -> &Self {
        self.insert(path, Node::Link(target.into()), 0)
    }

    /// Link visible from the `probe`-th `exists` check on it.
    pub fn late_link(&self, path: &str, target: &str, probe: u32) -> &Self {
        self.insert(path, Node::Link(target.into()), probe)
    }

    /// `/dev/<name>` with a sysfs wwid and a `delete` control file.
    pub fn disk(&self, name: &str, wwid: &str) -> &Self {
        self.file(&format!("/dev/{}", name), "")
            .file(&format!("/sys/block/{}/device/wwid", name), wwid)
            .file(&format!("/sys/block/{}/device/delete", name), "")
    }

    pub fn remove(&self, prefix: &str) -> &Self {
        self.entries
            .lock()
            .unwrap()
            .retain(|p, _| !p.starts_with(prefix));
        self
    }

    pub fn probes(&self, path: &str) -> u32 {
        self.probes
            .lock()
            .unwrap()
            .get(Path::new(path))
            .copied()
            .unwrap_or(0)
    }

    fn insert(&self, path: &str, node: Node, hidden_probes: u32) -> &Self {
        self.entries
            .lock()
            .unwrap()
            .insert(path.into(), (node, hidden_probes));
        self
    }

    fn visible(&self, path: &Path) -> Option<Node> {
        let entries = self.entries.lock().unwrap();
        let (node, hidden) = entries.get(path)?;
        let seen = self.probes.lock().unwrap().get(path).copied().unwrap_or(0);
        (seen >= *hidden).then(|| node.clone())
    }

    fn is_dir(&self, path: &Path) -> bool {
        let keys: Vec<PathBuf> = self.entries.lock().unwrap().keys().cloned().collect();
        keys.iter()
            .any(|p| p != path && p.starts_with(path) && self.visible(p).is_some())
    }

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..8 {
            match self.visible(&current) {
                Some(Node::Link(target)) => current = target,
                Some(Node::File(_)) => return Some(current),
                None if self.is_dir(&current) => return Some(current),
                None => return None,
            }
        }
        None
    }

    fn visible_paths(&self) -> Vec<PathBuf> {
        let keys: Vec<PathBuf> = self.entries.lock().unwrap().keys().cloned().collect();
        let mut all = Vec::new();
        for key in keys.into_iter().filter(|k| self.visible(k).is_some()) {
            for ancestor in key.ancestors() {
                if ancestor == Path::new("/") || ancestor.as_os_str().is_empty() {
                    break;
                }
                all.push(ancestor.to_path_buf());
            }
        }
        all.sort();
        all.dedup();
        all
    }
}

impl HostIo for MemHost {
    fn exists(&self, path: &Path) -> bool {
        *self
            .probes
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default() += 1;
        self.resolve(path).is_some()
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        let Ok(pattern) = glob::Pattern::new(pattern) else {
            return Vec::new();
        };
        self.visible_paths()
            .into_iter()
            .filter(|p| pattern.matches_path(p))
            .collect()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        match self.resolve(path).and_then(|p| self.visible(&p)) {
            Some(Node::File(contents)) => Ok(contents),
            _ => Err(io::Error::from(io::ErrorKind::NotFound)),
        }
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        self.resolve(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        let names: Vec<String> = self
            .visible_paths()
            .into_iter()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        if names.is_empty() {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(names)
    }
}

type Hook = Box<dyn Fn() + Send + Sync>;

struct Rule {
    tokens: Vec<&'static str>,
    exit_code: i32,
    stderr: &'static str,
    hook: Option<Hook>,
}

/// One executed command and the task that ran it.
#[derive(Debug, Clone)]
pub struct Call {
    pub caller: Option<&'static str>,
    pub command: String,
}

/// Executor answering from token rules; unmatched commands succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            ..Default::default()
        })
    }

    pub fn fail(&self, tokens: &[&'static str], exit_code: i32, stderr: &'static str) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            tokens: tokens.to_vec(),
            exit_code,
            stderr,
            hook: None,
        });
        self
    }

    pub fn on(&self, tokens: &[&'static str], hook: impl Fn() + Send + Sync + 'static) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            tokens: tokens.to_vec(),
            exit_code: 0,
            stderr: "",
            hook: Some(Box::new(hook)),
        });
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.command.contains(needle))
            .count()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, cmd: &CommandSpec) -> Result<ExecOutput, ExecError> {
        self.calls.lock().unwrap().push(Call {
            caller: CALLER.try_with(|c| *c).ok(),
            command: cmd.render(),
        });
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let argv = cmd.argv();
        let exit_code = {
            let rules = self.rules.lock().unwrap();
            match rules
                .iter()
                .find(|r| r.tokens.iter().all(|t| argv.contains(t)))
            {
                Some(rule) => {
                    if let Some(hook) = &rule.hook {
                        hook();
                    }
                    if rule.exit_code != 0 && !cmd.ok_codes.contains(&rule.exit_code) {
                        return Err(ExecError::failed(cmd, rule.exit_code, "", rule.stderr));
                    }
                    rule.exit_code
                }
                None => 0,
            }
        };
        Ok(ExecOutput {
            exit_code,
            ..Default::default()
        })
    }
}

/// Factory over the fakes with a private lock directory and short waits.
pub struct Harness {
    pub exec: Arc<ScriptedExecutor>,
    pub host: Arc<MemHost>,
    pub factory: ConnectorFactory,
    _locks: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ScriptedExecutor::new(), |_| {})
    }

    pub fn with(exec: Arc<ScriptedExecutor>, tweak: impl FnOnce(&mut ConnectorConfig)) -> Self {
        let locks = tempfile::tempdir().unwrap();
        let mut config = ConnectorConfig {
            root_helper: Vec::new(),
            device_scan_attempts: 4,
            device_scan_interval_ms: 100,
            device_scan_max_interval_ms: 1000,
            command_retry_interval_ms: 100,
            lock_path: locks.path().to_path_buf(),
            lock_poll_interval_ms: 10,
            ..Default::default()
        };
        tweak(&mut config);
        let host = MemHost::new();
        let factory = ConnectorFactory::new(exec.clone(), host.clone(), config);
        Self {
            exec,
            host,
            factory,
            _locks: locks,
        }
    }
}
