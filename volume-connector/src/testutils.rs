//! In-memory host and scripted executor for tests.
//!
//! [`FakeHost`] models `/dev` and `/sys` as a map of files and symlinks.
//! Entries can be made to show up only after a number of probes, which is
//! how tests simulate a kernel that is slow to create device nodes.
//!
//! [`FakeExecutor`] records every command (tagged with the [`CALLER`]
//! task-local when set) and answers from rules matched on argv tokens. Rules
//! may carry a hook that mutates the fake host, e.g. a login that makes a
//! disk appear.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::ConnectorConfig;
use crate::connector::ConnectorContext;
use crate::executor::{CommandSpec, ExecError, ExecOutput, Executor};
use crate::host::HostIo;

tokio::task_local! {
    /// Label recorded with each executor call made inside its scope.
    pub static CALLER: String;
}

#[derive(Debug, Clone)]
enum Node {
    File(String),
    Link(PathBuf),
}

#[derive(Debug, Clone)]
struct Entry {
    node: Node,
    /// Invisible until `exists` has been asked about it this many times
    visible_from_probe: u32,
}

#[derive(Debug, Default)]
struct HostState {
    entries: HashMap<PathBuf, Entry>,
    probes: HashMap<PathBuf, u32>,
}

impl HostState {
    fn visible(&self, path: &Path) -> Option<&Entry> {
        let entry = self.entries.get(path)?;
        let probes = self.probes.get(path).copied().unwrap_or(0);
        (probes >= entry.visible_from_probe).then_some(entry)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.entries
            .keys()
            .any(|p| p != path && p.starts_with(path) && self.visible(p).is_some())
    }

    fn resolve(&self, path: &Path) -> Option<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..16 {
            match self.visible(&current).map(|e| &e.node) {
                Some(Node::Link(target)) => current = target.clone(),
                Some(Node::File(_)) => return Some(current),
                None if self.is_dir(&current) => return Some(current),
                None => return None,
            }
        }
        None
    }

    fn all_paths(&self) -> BTreeSet<PathBuf> {
        let mut paths = BTreeSet::new();
        for path in self.entries.keys() {
            if self.visible(path).is_none() {
                continue;
            }
            for ancestor in path.ancestors() {
                if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
                    break;
                }
                paths.insert(ancestor.to_path_buf());
            }
        }
        paths
    }
}

/// In-memory [`HostIo`].
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
}

impl FakeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a regular file (e.g. a sysfs attribute).
    pub fn add_file(&self, path: impl AsRef<Path>, contents: &str) -> &Self {
        self.insert(path.as_ref(), Node::File(contents.to_string()), 0)
    }

    /// Add a symlink (e.g. a `/dev/disk/by-path` entry).
    pub fn add_link(&self, path: impl AsRef<Path>, target: impl AsRef<Path>) -> &Self {
        self.insert(path.as_ref(), Node::Link(target.as_ref().to_path_buf()), 0)
    }

    /// Add a block device node.
    pub fn add_device(&self, path: impl AsRef<Path>) -> &Self {
        self.add_file(path, "")
    }

    /// Symlink that only becomes visible on the `probe`-th `exists` check.
    pub fn add_link_on_probe(
        &self,
        path: impl AsRef<Path>,
        target: impl AsRef<Path>,
        probe: u32,
    ) -> &Self {
        self.insert(
            path.as_ref(),
            Node::Link(target.as_ref().to_path_buf()),
            probe,
        )
    }

    /// A SCSI disk `/dev/<name>` with its sysfs `wwid` and a by-path link.
    pub fn add_scsi_disk(&self, by_path: impl AsRef<Path>, name: &str, wwid: &str) -> &Self {
        let dev = format!("/dev/{}", name);
        self.add_device(&dev)
            .add_file(format!("/sys/block/{}/device/wwid", name), wwid)
            .add_link(by_path, &dev)
    }

    /// Remove `path` and everything under it.
    pub fn remove(&self, path: impl AsRef<Path>) -> &Self {
        let path = path.as_ref();
        let mut state = self.state.lock().unwrap();
        state.entries.retain(|p, _| !p.starts_with(path));
        self
    }

    /// Number of `exists` probes made against `path`.
    pub fn probes(&self, path: impl AsRef<Path>) -> u32 {
        let state = self.state.lock().unwrap();
        state.probes.get(path.as_ref()).copied().unwrap_or(0)
    }

    fn insert(&self, path: &Path, node: Node, visible_from_probe: u32) -> &Self {
        let mut state = self.state.lock().unwrap();
        state.entries.insert(
            path.to_path_buf(),
            Entry {
                node,
                visible_from_probe,
            },
        );
        self
    }
}

impl HostIo for FakeHost {
    fn exists(&self, path: &Path) -> bool {
        let mut state = self.state.lock().unwrap();
        *state.probes.entry(path.to_path_buf()).or_default() += 1;
        state.resolve(path).is_some()
    }

    fn glob(&self, pattern: &str) -> Vec<PathBuf> {
        let Ok(pattern) = glob::Pattern::new(pattern) else {
            return Vec::new();
        };
        let state = self.state.lock().unwrap();
        state
            .all_paths()
            .into_iter()
            .filter(|p| pattern.matches_path(p))
            .collect()
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state.lock().unwrap();
        let resolved = state
            .resolve(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        match state.visible(&resolved).map(|e| &e.node) {
            Some(Node::File(contents)) => Ok(contents.clone()),
            _ => Err(io::Error::from(io::ErrorKind::InvalidInput)),
        }
    }

    fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .resolve(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn read_dir_names(&self, path: &Path) -> io::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let names: BTreeSet<String> = state
            .all_paths()
            .into_iter()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        if names.is_empty() && !state.is_dir(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(names.into_iter().collect())
    }
}

type Hook = Arc<dyn Fn(&CommandSpec) + Send + Sync>;

struct Rule {
    tokens: Vec<String>,
    outcome: Result<String, (i32, String)>,
    remaining: Option<usize>,
    hook: Option<Hook>,
}

impl Rule {
    fn matches(&self, cmd: &CommandSpec) -> bool {
        let argv = cmd.argv();
        self.remaining != Some(0) && self.tokens.iter().all(|t| argv.contains(&t.as_str()))
    }
}

/// One recorded executor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub caller: Option<String>,
    pub argv: Vec<String>,
    pub stdin: Option<String>,
    pub privileged: bool,
}

impl Call {
    pub fn rendered(&self) -> String {
        self.argv.join(" ")
    }
}

/// Recording, rule-driven [`Executor`]. Unmatched commands succeed silently.
#[derive(Default)]
pub struct FakeExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Call>>,
    latency: Option<Duration>,
}

impl FakeExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every call sleeps this long, which lets concurrent callers interleave.
    pub fn with_latency(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency: Some(latency),
            ..Default::default()
        })
    }

    fn push(&self, tokens: &[&str], outcome: Result<String, (i32, String)>, remaining: Option<usize>, hook: Option<Hook>) {
        self.rules.lock().unwrap().push(Rule {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            outcome,
            remaining,
            hook,
        });
    }

    /// Commands containing all `tokens` print `stdout`.
    pub fn respond(&self, tokens: &[&str], stdout: &str) -> &Self {
        self.push(tokens, Ok(stdout.to_string()), None, None);
        self
    }

    /// Commands containing all `tokens` exit with `code`.
    pub fn fail(&self, tokens: &[&str], code: i32, stderr: &str) -> &Self {
        self.push(tokens, Err((code, stderr.to_string())), None, None);
        self
    }

    /// Like [`FakeExecutor::fail`] for the first `times` matches only.
    pub fn fail_times(&self, tokens: &[&str], times: usize, code: i32, stderr: &str) -> &Self {
        self.push(tokens, Err((code, stderr.to_string())), Some(times), None);
        self
    }

    /// Run `hook` and succeed for commands containing all `tokens`.
    pub fn on<F>(&self, tokens: &[&str], hook: F) -> &Self
    where
        F: Fn(&CommandSpec) + Send + Sync + 'static,
    {
        self.push(tokens, Ok(String::new()), None, Some(Arc::new(hook)));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Rendered argv of every call.
    pub fn commands(&self) -> Vec<String> {
        self.calls().iter().map(Call::rendered).collect()
    }

    /// Number of calls containing all `tokens`.
    pub fn count(&self, tokens: &[&str]) -> usize {
        self.calls()
            .iter()
            .filter(|c| tokens.iter().all(|t| c.argv.iter().any(|a| a == t)))
            .count()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, cmd: &CommandSpec) -> Result<ExecOutput, ExecError> {
        self.calls.lock().unwrap().push(Call {
            caller: CALLER.try_with(|c| c.clone()).ok(),
            argv: cmd.argv().iter().map(|s| s.to_string()).collect(),
            stdin: cmd.stdin.clone(),
            privileged: cmd.privileged,
        });

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let (outcome, hook) = {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.matches(cmd)) {
                Some(rule) => {
                    if let Some(n) = rule.remaining.as_mut() {
                        *n -= 1;
                    }
                    (rule.outcome.clone(), rule.hook.clone())
                }
                None => (Ok(String::new()), None),
            }
        };

        if let Some(hook) = hook {
            hook(cmd);
        }

        match outcome {
            Ok(stdout) => Ok(ExecOutput::new(stdout)),
            Err((code, _)) if cmd.ok_codes.contains(&code) => Ok(ExecOutput {
                exit_code: code,
                ..Default::default()
            }),
            Err((code, stderr)) => Err(ExecError::failed(cmd, code, "", &stderr)),
        }
    }
}

/// Fake host, fake executor and a config with a private lock directory.
///
/// Scan and command retries keep their shapes but use short intervals so
/// paused-clock tests stay readable.
pub struct TestBed {
    pub exec: Arc<FakeExecutor>,
    pub host: Arc<FakeHost>,
    pub config: ConnectorConfig,
    _lock_dir: TempDir,
}

impl TestBed {
    pub fn new() -> Self {
        Self::with_executor(FakeExecutor::new())
    }

    pub fn with_executor(exec: Arc<FakeExecutor>) -> Self {
        let lock_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => panic!("cannot create lock directory: {}", e),
        };
        let config = ConnectorConfig {
            root_helper: Vec::new(),
            device_scan_attempts: 5,
            device_scan_interval_ms: 100,
            device_scan_max_interval_ms: 800,
            command_retries: 3,
            command_retry_interval_ms: 100,
            lock_path: lock_dir.path().to_path_buf(),
            lock_timeout_secs: 30,
            lock_poll_interval_ms: 10,
            ..ConnectorConfig::default()
        };
        Self {
            exec,
            host: FakeHost::new(),
            config,
            _lock_dir: lock_dir,
        }
    }

    pub fn context(&self) -> ConnectorContext {
        ConnectorContext::new(
            self.exec.clone(),
            self.host.clone(),
            Arc::new(self.config.clone()),
        )
    }
}

impl Default for TestBed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fake_host_links_and_probes() {
        let host = FakeHost::new();
        host.add_scsi_disk("/dev/disk/by-path/ip-1-lun-0", "sdb", "naa.1");
        host.add_link_on_probe("/dev/disk/by-path/ip-2-lun-0", "/dev/sdc", 3);
        host.add_device("/dev/sdc");

        assert!(host.exists(Path::new("/dev/disk/by-path/ip-1-lun-0")));
        assert_eq!(
            host.canonicalize(Path::new("/dev/disk/by-path/ip-1-lun-0")).unwrap(),
            PathBuf::from("/dev/sdb")
        );
        assert_eq!(
            host.read_trimmed(Path::new("/sys/block/sdb/device/wwid")).as_deref(),
            Some("naa.1")
        );

        let late = Path::new("/dev/disk/by-path/ip-2-lun-0");
        assert!(!host.exists(late));
        assert!(!host.exists(late));
        assert!(host.exists(late));
        assert_eq!(host.probes(late), 3);

        assert_eq!(host.glob("/dev/disk/by-path/ip-*-lun-0").len(), 2);
        assert_eq!(
            host.read_dir_names(Path::new("/sys/block")).unwrap(),
            vec!["sdb".to_string()]
        );

        host.remove("/dev/sdb");
        assert!(!host.exists(Path::new("/dev/disk/by-path/ip-1-lun-0")));
    }

    #[tokio::test]
    async fn test_fake_executor_rules_and_records() {
        let host = FakeHost::new();
        let exec = FakeExecutor::new();
        let h = host.clone();
        exec.fail_times(&["iscsiadm", "--login"], 1, 8, "timeout")
            .on(&["iscsiadm", "--login"], move |_| {
                h.add_device("/dev/sdb");
            })
            .respond(&["blockdev"], "1073741824\n");

        let login = CommandSpec::new("iscsiadm").args(["-m", "node", "--login"]);
        assert_eq!(exec.execute(&login).await.unwrap_err().exit_code(), Some(8));
        assert!(exec.execute(&login).await.is_ok());
        assert!(host.exists(Path::new("/dev/sdb")));

        let out = CALLER
            .scope("a".to_string(), exec.execute(&CommandSpec::new("blockdev")))
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "1073741824");
        assert_eq!(exec.count(&["iscsiadm"]), 2);
        assert_eq!(exec.calls()[2].caller.as_deref(), Some("a"));
    }
}
