use std::{
    collections::HashMap,
    io,
    os::unix::fs::MetadataExt as _,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use super::sandbox::{self, kill_process_group, Limits, RawExit, Sandbox};
use crate::config::Config;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(10);
/// The scratch directory is measured every this many samples.
const SCRATCH_EVERY: u64 = 5;
/// Minimum charge per scratch entry, so that empty files are not free.
const SCRATCH_ENTRY_BYTES: u64 = 4096;
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ResourceKind {
    CpuTime,
    Memory,
    FileSize,
    ScratchSpace,
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "kebab-case")]
pub enum Termination {
    Exited { code: i32 },
    TimedOut,
    ResourceExceeded { resource: ResourceKind },
    Crashed { signal: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub termination: Termination,
    pub stdout: String,
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: bool,
    #[serde(default)]
    pub stderr_truncated: bool,
    #[serde(with = "crate::serdable::duration_ms")]
    pub duration: Duration,
}

impl ExecutionOutcome {
    pub fn timed_out(&self) -> bool {
        matches!(self.termination, Termination::TimedOut)
    }

    pub fn resource_exceeded(&self) -> Option<ResourceKind> {
        match self.termination {
            Termination::ResourceExceeded { resource } => Some(resource),
            _ => None,
        }
    }

    /// `None` unless the program exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { code } => Some(code),
            _ => None,
        }
    }
}

/// The program could not be started at all. Everything that happens once it
/// runs is an [`ExecutionOutcome`].
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Cannot prepare scratch directory: {0}")]
    Scratch(#[from] fsutil::Error),

    #[error("Failed to spawn '{}': {source}", .program.to_string_lossy())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot open {0} of the child process")]
    Pipe(&'static str),

    #[error("Lost track of the child process: {0}")]
    Wait(#[source] io::Error),
}

/// Runs a compiled program against one stdin payload inside a sandbox.
#[derive(Debug, Clone)]
pub struct ExecutionStage {
    sandbox: Arc<dyn Sandbox>,
    limits: Limits,
    stdout_cap: usize,
    stderr_cap: usize,
}

impl ExecutionStage {
    pub fn new(sandbox: Arc<dyn Sandbox>, limits: Limits) -> Self {
        Self {
            sandbox,
            limits,
            stdout_cap: 64 * 1024,
            stderr_cap: 16 * 1024,
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(sandbox::from_config(cfg), Limits::from_config(&cfg.run))
            .output_caps(cfg.run.stdout_max_bytes, cfg.run.stderr_max_bytes)
    }

    pub fn output_caps(mut self, stdout: usize, stderr: usize) -> Self {
        self.stdout_cap = stdout;
        self.stderr_cap = stderr;
        self
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn sandbox(&self) -> &dyn Sandbox {
        self.sandbox.as_ref()
    }

    /// Run `program` with `scratch` as its private working directory.
    /// Every process the program started is gone when this returns.
    pub async fn run(
        &self,
        program: &Path,
        scratch: &Path,
        stdin_payload: &[u8],
    ) -> Result<ExecutionOutcome, LaunchError> {
        fsutil::mkdir_all(scratch)?;

        let mut proc = self
            .sandbox
            .command(program, scratch, &self.limits)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: program.to_owned(),
                source,
            })?;
        let start_at = tokio::time::Instant::now();

        let pid = proc.id().ok_or(LaunchError::Pipe("pid"))?;
        let mut stdin = proc.stdin.take().ok_or(LaunchError::Pipe("stdin"))?;
        let stdout = proc.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;
        let stderr = proc.stderr.take().ok_or(LaunchError::Pipe("stderr"))?;

        // a program that never reads its input must not block us
        let payload = stdin_payload.to_vec();
        let feeder = tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                log::debug!("stdin not fully consumed: {}", e);
            }
            drop(stdin);
        });
        let stdout_task = tokio::spawn(read_capped(stdout, self.stdout_cap));
        let stderr_task = tokio::spawn(read_capped(stderr, self.stderr_cap));

        let mut usage = Usage::default();
        let ending = tokio::select! {
            ending = self.watch(pid, scratch, &mut usage) => ending,
            _ = tokio::time::sleep(self.limits.wall_time) => Ending::TimedOut,
        };
        let duration = start_at.elapsed();

        // the leader is not reaped yet, so the group id cannot have been reused
        kill_process_group(pid);
        feeder.abort();
        let status = proc.wait().await;
        if let Err(e) = &status {
            log::warn!("Failed to reap process {}: {}", pid, e);
        }

        let termination = match ending {
            Ending::TimedOut => Termination::TimedOut,
            Ending::LimitHit(resource) => Termination::ResourceExceeded { resource },
            Ending::Exited => match self.sandbox.decode_exit(status.map_err(LaunchError::Wait)?) {
                RawExit::Code(code) => Termination::Exited { code },
                RawExit::Signal(signal) => classify_signal(signal, &usage, &self.limits),
            },
        };

        let (stdout, stdout_truncated) = collect(stdout_task).await;
        let (stderr, stderr_truncated) = collect(stderr_task).await;

        log::debug!(
            "{} finished: {:?} in {}ms",
            program.to_string_lossy(),
            termination,
            duration.as_millis()
        );

        Ok(ExecutionOutcome {
            termination,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            duration,
        })
    }
}

enum Ending {
    Exited,
    LimitHit(ResourceKind),
    TimedOut,
}

impl ExecutionStage {
    /// Samples the program's whole process tree and its scratch directory
    /// until the spawned process exits or a budget is exceeded. The exited
    /// process is left unreaped.
    async fn watch(&self, pid: u32, scratch: &Path, usage: &mut Usage) -> Ending {
        let depth = self.sandbox.wrapper_depth();
        let mut interval = tokio::time::interval(SAMPLE_INTERVAL);
        let mut round = 0u64;
        loop {
            interval.tick().await;
            round += 1;
            if has_exited(pid) {
                return Ending::Exited;
            }

            let scratch = (round % SCRATCH_EVERY == 1).then(|| scratch.to_owned());
            let sample = tokio::task::spawn_blocking(move || {
                let tree = sample_tree(pid, depth);
                let scratch = scratch.map(|dir| scratch_usage(&dir));
                (tree, scratch)
            })
            .await;
            let Ok((tree, scratch_bytes)) = sample else {
                continue;
            };
            usage.record(&tree, scratch_bytes);

            if let Some(resource) = usage.exceeded(&self.limits) {
                return Ending::LimitHit(resource);
            }
        }
    }
}

/// Whether `pid` is a zombie (or already gone), without reaping it.
fn has_exited(pid: u32) -> bool {
    let Ok(id) = libc::id_t::try_from(pid) else {
        return true;
    };
    // SAFETY: zeroed siginfo_t is a valid out parameter for waitid.
    unsafe {
        let mut info: libc::siginfo_t = std::mem::zeroed();
        let flags = libc::WEXITED | libc::WNOWAIT | libc::WNOHANG;
        if libc::waitid(libc::P_PID, id, &mut info, flags) != 0 {
            return true;
        }
        info.si_pid() != 0
    }
}

fn classify_signal(signal: i32, usage: &Usage, limits: &Limits) -> Termination {
    let resource = match signal {
        libc::SIGXCPU => Some(ResourceKind::CpuTime),
        libc::SIGXFSZ => Some(ResourceKind::FileSize),
        libc::SIGKILL if usage.cpu >= limits.cpu_time => Some(ResourceKind::CpuTime),
        // killed by a memory cgroup
        libc::SIGKILL if usage.near_memory_limit(limits) => Some(ResourceKind::Memory),
        libc::SIGSEGV | libc::SIGABRT | libc::SIGKILL | libc::SIGBUS
            if usage.near_address_space_limit(limits) =>
        {
            Some(ResourceKind::Memory)
        }
        _ => None,
    };
    match resource {
        Some(resource) => Termination::ResourceExceeded { resource },
        None => Termination::Crashed { signal },
    }
}

//---------------------------------------------------------
// output capture

pub(crate) struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Keep the first `cap` bytes and drain the rest so the writer never blocks.
pub(crate) async fn read_capped<R>(mut reader: R, cap: usize) -> io::Result<Captured>
where
    R: AsyncRead + Unpin,
{
    let mut out = Captured {
        bytes: Vec::new(),
        truncated: false,
    };
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(out);
        }
        let room = cap.saturating_sub(out.bytes.len());
        if n > room {
            out.truncated = true;
        }
        out.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
}

pub(crate) async fn collect(task: tokio::task::JoinHandle<io::Result<Captured>>) -> (String, bool) {
    let abort = task.abort_handle();
    match tokio::time::timeout(DRAIN_GRACE, task).await {
        Ok(Ok(Ok(c))) => (String::from_utf8_lossy(&c.bytes).into_owned(), c.truncated),
        Ok(Ok(Err(e))) => {
            log::warn!("Failed to read program output: {}", e);
            (String::new(), false)
        }
        Ok(Err(e)) => {
            log::warn!("Output reader panicked: {}", e);
            (String::new(), false)
        }
        Err(_) => {
            // a descendant escaped the process group and still holds the pipe
            abort.abort();
            log::warn!("Output pipe still open after the program ended; dropped");
            (String::new(), true)
        }
    }
}

//---------------------------------------------------------
// /proc sampling

#[derive(Debug, Clone, Copy, Default)]
struct Usage {
    cpu: Duration,
    peak_rss_bytes: u64,
    peak_vm_bytes: u64,
    scratch_bytes: u64,
}

impl Usage {
    fn record(&mut self, tree: &TreeSample, scratch_bytes: Option<u64>) {
        let ticks_per_sec = clock_ticks_per_sec();
        self.cpu = self
            .cpu
            .max(Duration::from_secs_f64(tree.cpu_ticks as f64 / ticks_per_sec as f64));
        self.peak_rss_bytes = self.peak_rss_bytes.max(tree.rss_bytes);
        self.peak_vm_bytes = self.peak_vm_bytes.max(tree.max_vm_bytes);
        if let Some(bytes) = scratch_bytes {
            self.scratch_bytes = bytes;
        }
    }

    fn exceeded(&self, limits: &Limits) -> Option<ResourceKind> {
        if self.cpu >= limits.cpu_time {
            return Some(ResourceKind::CpuTime);
        }
        if self.peak_rss_bytes > limits.memory_bytes {
            return Some(ResourceKind::Memory);
        }
        if self.scratch_bytes > limits.scratch_bytes {
            return Some(ResourceKind::ScratchSpace);
        }
        None
    }

    fn near_memory_limit(&self, limits: &Limits) -> bool {
        limits.memory_bytes > 0 && self.peak_rss_bytes >= limits.memory_bytes / 10 * 9
    }

    fn near_address_space_limit(&self, limits: &Limits) -> bool {
        let ceiling = limits.address_space_bytes();
        ceiling > 0 && self.peak_vm_bytes >= ceiling / 10 * 9
    }
}

fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no memory-safety preconditions.
    let t = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if t > 0 {
        t as u64
    } else {
        100
    }
}

fn page_size() -> u64 {
    // SAFETY: as above.
    let p = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if p > 0 {
        p as u64
    } else {
        4096
    }
}

/// The fields of `/proc/<pid>/stat` the sampler needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    pid: u32,
    ppid: u32,
    /// utime + stime
    cpu_ticks: u64,
    /// cutime + cstime: children already waited for
    reaped_ticks: u64,
    vm_bytes: u64,
    rss_pages: u64,
}

/// The command name may contain spaces and parentheses, so fields are
/// counted from the last ')'.
fn parse_stat(stat: &str) -> Option<ProcStat> {
    let open = stat.find(" (")?;
    let pid = stat[..open].trim().parse().ok()?;
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let num = |i: usize| -> Option<u64> { fields.get(i)?.parse().ok() };
    Some(ProcStat {
        pid,
        ppid: num(1)? as u32,
        cpu_ticks: num(11)? + num(12)?,
        reaped_ticks: num(13)? + num(14)?,
        vm_bytes: num(20)?,
        rss_pages: num(21)?,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TreeSample {
    cpu_ticks: u64,
    rss_bytes: u64,
    /// Largest single address space; the address-space limit is per process.
    max_vm_bytes: u64,
}

fn sample_tree(root: u32, wrapper_depth: usize) -> TreeSample {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return TreeSample::default();
    };
    let procs = entries.filter_map(|e| {
        let e = e.ok()?;
        e.file_name().to_str()?.parse::<u32>().ok()?;
        parse_stat(&std::fs::read_to_string(e.path().join("stat")).ok()?)
    });
    sum_tree(procs, root, wrapper_depth, page_size())
}

/// Adds up everything below `root`. Wrapper processes count only through
/// the children they reaped, which is how orphans end up being charged.
fn sum_tree(
    procs: impl IntoIterator<Item = ProcStat>,
    root: u32,
    wrapper_depth: usize,
    page_size: u64,
) -> TreeSample {
    let mut children: HashMap<u32, Vec<ProcStat>> = HashMap::new();
    let mut root_stat = None;
    for p in procs {
        if p.pid == root {
            root_stat = Some(p);
        } else {
            children.entry(p.ppid).or_default().push(p);
        }
    }
    let Some(root_stat) = root_stat else {
        return TreeSample::default();
    };

    let mut sample = TreeSample::default();
    let mut stack = vec![(root_stat, 0usize)];
    while let Some((p, depth)) = stack.pop() {
        if depth + 1 == wrapper_depth {
            sample.cpu_ticks += p.reaped_ticks;
        } else if depth >= wrapper_depth {
            sample.cpu_ticks += p.cpu_ticks + p.reaped_ticks;
            sample.rss_bytes += p.rss_pages * page_size;
            sample.max_vm_bytes = sample.max_vm_bytes.max(p.vm_bytes);
        }
        if let Some(kids) = children.remove(&p.pid) {
            stack.extend(kids.into_iter().map(|k| (k, depth + 1)));
        }
    }
    sample
}

/// Bytes held in `dir`: apparent or allocated size, whichever is larger,
/// and at least [`SCRATCH_ENTRY_BYTES`] per entry.
fn scratch_usage(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        total += meta.len().max(meta.blocks() * 512).max(SCRATCH_ENTRY_BYTES);
        if meta.is_dir() {
            total += scratch_usage(&entry.path());
        }
    }
    total
}
