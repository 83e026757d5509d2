use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::config::{Config, RunConfig, SandboxKind};

const SANDBOX_PATH_ENV: &str = "/usr/local/bin:/usr/bin:/bin";

/// Read-only system directories visible inside an nsjail jail.
const SYSTEM_DIRS: &[&str] = &["/bin", "/lib", "/lib64", "/usr", "/dev/urandom"];

/// Bounds applied to every execution of an untrusted program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub memory_bytes: u64,
    pub max_processes: u64,
    pub max_file_bytes: u64,
    pub max_open_files: u64,
    /// Total bytes the program may keep in its scratch directory.
    pub scratch_bytes: u64,
    pub isolate_network: bool,
}

impl Limits {
    pub fn from_config(cfg: &RunConfig) -> Self {
        Self {
            wall_time: cfg.wall_time(),
            cpu_time: cfg.cpu_time(),
            memory_bytes: cfg.memory_bytes(),
            max_processes: cfg.max_processes,
            max_file_bytes: cfg.max_file_bytes,
            max_open_files: cfg.max_open_files,
            scratch_bytes: cfg.scratch_max_bytes,
            isolate_network: cfg.isolate_network,
        }
    }

    /// Whole seconds, rounded up, never zero.
    pub fn cpu_secs_ceil(&self) -> u64 {
        let secs = self.cpu_time.as_secs() + u64::from(self.cpu_time.subsec_nanos() > 0);
        secs.max(1)
    }

    /// Hard address-space ceiling. Resident memory is held to `memory_bytes`
    /// by sampling; the headroom keeps allocation failures attributable.
    pub fn address_space_bytes(&self) -> u64 {
        self.memory_bytes.saturating_mul(2)
    }
}

/// Exit as decoded by the sandbox: a code, or the signal that ended the program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawExit {
    Code(i32),
    Signal(i32),
}

/// An isolation backend. The engine only relies on the capability set
/// (bounded CPU, memory and wall time, no network, private filesystem,
/// private process table); how a backend provides it is its own business.
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> SandboxKind;

    /// Command that runs `program` with `scratch` as its private working
    /// directory. The command must start a new process group.
    fn command(&self, program: &Path, scratch: &Path, limits: &Limits) -> Command;

    fn decode_exit(&self, status: ExitStatus) -> RawExit;

    /// Number of sandbox processes between the spawned pid and the program.
    /// They are left out when the process tree is measured.
    fn wrapper_depth(&self) -> usize;
}

/// The configured backend. Staged sources, scratch space and reports of
/// every submission are kept out of the program's sight.
pub fn from_config(cfg: &Config) -> Arc<dyn Sandbox> {
    match cfg.run.sandbox {
        SandboxKind::Rlimit => Arc::new(RlimitSandbox::new().hiding([
            cfg.fetch.data_root.clone(),
            cfg.run.scratch_root(),
            cfg.report.dir.clone(),
        ])),
        SandboxKind::Nsjail => {
            Arc::new(NsjailSandbox::new(cfg.run.nsjail_path.clone()).with_cgroups(cfg.run.nsjail_cgroups))
        }
    }
}

/// Send SIGKILL to a whole process group. A group that is already gone is fine.
pub fn kill_process_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    if pgid <= 1 {
        return;
    }
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to kill process group {}: {}", pgid, err);
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_owned())
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_owned();
    }
    match std::env::current_dir() {
        Ok(cwd) => fsutil::normalize_path(cwd.join(path)),
        Err(_) => path.to_owned(),
    }
}

fn cstring(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

//---------------------------------------------------------
// rlimit backend

/// Unprivileged namespaces + setrlimit, no external tool needed.
///
/// The program gets its own user, mount and PID namespaces (and network
/// namespace when asked). Every hidden directory is covered by an empty
/// tmpfs; only the program's own directory and its scratch directory are
/// bound back underneath. The spawned process stays outside to relay the
/// exit status, a second one is init of the new PID namespace, and the
/// program runs below it, so it can neither see nor signal anything else.
#[derive(Debug, Clone, Default)]
pub struct RlimitSandbox {
    hidden: Vec<PathBuf>,
}

impl RlimitSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directories the program must not see. Missing ones are skipped at
    /// launch time.
    pub fn hiding(mut self, dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        self.hidden.extend(
            dirs.into_iter()
                .filter(|d| !d.as_os_str().is_empty())
                .map(|d| absolute(&d)),
        );
        self
    }

    pub fn hidden(&self) -> &[PathBuf] {
        &self.hidden
    }
}

#[derive(Debug, Clone, Copy)]
struct RlimitSet {
    cpu_secs: u64,
    address_space: u64,
    processes: u64,
    file_size: u64,
    open_files: u64,
}

macro_rules! set_rlimit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let lim = libc::rlimit {
            rlim_cur: $soft as libc::rlim_t,
            rlim_max: $hard as libc::rlim_t,
        };
        // SAFETY: `lim` is a valid rlimit for the duration of the call.
        if unsafe { libc::setrlimit($resource, &lim) } != 0 {
            return Err(io::Error::last_os_error());
        }
    }};
}

impl RlimitSet {
    fn new(limits: &Limits) -> Self {
        Self {
            cpu_secs: limits.cpu_secs_ceil(),
            address_space: limits.address_space_bytes(),
            processes: limits.max_processes,
            file_size: limits.max_file_bytes,
            open_files: limits.max_open_files,
        }
    }

    fn apply(&self) -> io::Result<()> {
        set_rlimit!(libc::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1);
        set_rlimit!(libc::RLIMIT_AS, self.address_space, self.address_space);
        set_rlimit!(libc::RLIMIT_NPROC, self.processes, self.processes);
        set_rlimit!(libc::RLIMIT_FSIZE, self.file_size, self.file_size);
        set_rlimit!(libc::RLIMIT_NOFILE, self.open_files, self.open_files);
        Ok(())
    }
}

/// Directories the program keeps: the one holding the binary and scratch.
const KEPT_DIRS: usize = 2;

/// Where tmpfs goes and what is bound back under it, as plain paths.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MountLayout {
    /// Outermost first; nested or kept roots are dropped.
    hide: Vec<PathBuf>,
    rebind: Vec<RebindLayout>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RebindLayout {
    target: PathBuf,
    /// Created inside the tmpfs before binding, parents first. Ends with `target`.
    mkdirs: Vec<PathBuf>,
}

impl MountLayout {
    /// All paths must be canonical.
    fn plan(hidden: &[PathBuf], keep: &[PathBuf]) -> Self {
        let mut roots: Vec<PathBuf> = hidden
            .iter()
            .filter(|h| h.parent().is_some())
            .filter(|h| !keep.iter().any(|k| h.starts_with(k) && *h != k))
            .cloned()
            .collect();
        roots.sort();
        roots.dedup();
        let hide: Vec<PathBuf> = roots
            .iter()
            .filter(|h| !roots.iter().any(|o| o != *h && h.starts_with(o)))
            .cloned()
            .collect();

        let mut kept: Vec<&PathBuf> = keep.iter().collect();
        kept.sort();
        kept.dedup();
        let kept: Vec<&PathBuf> = kept
            .iter()
            .filter(|k| !kept.iter().any(|o| o != *k && k.starts_with(o)))
            .copied()
            .collect();

        let rebind = kept
            .into_iter()
            .filter_map(|k| {
                let root = hide.iter().find(|h| k.starts_with(h))?;
                let rel = k.strip_prefix(root).ok()?;
                let mut dir = root.clone();
                let mut mkdirs = Vec::new();
                for part in rel.components() {
                    dir.push(part);
                    mkdirs.push(dir.clone());
                }
                Some(RebindLayout {
                    target: k.clone(),
                    mkdirs,
                })
            })
            .collect();

        Self { hide, rebind }
    }
}

/// Everything the pre-exec hook needs, converted up front: after fork only
/// syscalls are allowed.
#[derive(Debug)]
struct Jail {
    rlimits: RlimitSet,
    deny_network: bool,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
    hide: Vec<CString>,
    rebind: Vec<(CString, Vec<CString>)>,
    workdir: CString,
}

const TMPFS: &[u8] = b"tmpfs\0";
const HIDE_OPTS: &[u8] = b"size=64k,mode=755\0";
const PROC: &[u8] = b"proc\0";
const PROC_DIR: &[u8] = b"/proc\0";
const ROOT_DIR: &[u8] = b"/\0";
const SETGROUPS: &[u8] = b"/proc/self/setgroups\0";
const UID_MAP: &[u8] = b"/proc/self/uid_map\0";
const GID_MAP: &[u8] = b"/proc/self/gid_map\0";
const NO_STATUS: libc::c_int = -1;
const OVERFLOW_ID: u32 = 65534;

fn c(bytes: &[u8]) -> *const libc::c_char {
    bytes.as_ptr().cast()
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Jail {
    fn new(limits: &Limits, layout: MountLayout, workdir: &Path) -> io::Result<Self> {
        // SAFETY: getuid/getgid cannot fail.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        // root outside would keep its capabilities across exec
        let inside = |id: u32| if id == 0 { OVERFLOW_ID } else { id };
        let rebind = layout
            .rebind
            .iter()
            .take(KEPT_DIRS)
            .map(|r| {
                let mkdirs = r.mkdirs.iter().map(|d| cstring(d)).collect::<io::Result<_>>()?;
                Ok((cstring(&r.target)?, mkdirs))
            })
            .collect::<io::Result<_>>()?;
        Ok(Self {
            rlimits: RlimitSet::new(limits),
            deny_network: limits.isolate_network,
            uid_map: format!("{} {} 1\n", inside(uid), uid).into_bytes(),
            gid_map: format!("{} {} 1\n", inside(gid), gid).into_bytes(),
            hide: layout.hide.iter().map(|h| cstring(h)).collect::<io::Result<_>>()?,
            rebind,
            workdir: cstring(workdir)?,
        })
    }

    /// Runs in the forked child before exec. Returns only in the process
    /// that goes on to exec the program.
    fn enter(&self) -> io::Result<()> {
        set_rlimit!(libc::RLIMIT_CORE, 0, 0);

        let mut flags = libc::CLONE_NEWUSER | libc::CLONE_NEWNS | libc::CLONE_NEWPID;
        if self.deny_network {
            flags |= libc::CLONE_NEWNET;
        }
        // SAFETY: plain syscall; the child is single-threaded after fork.
        check(unsafe { libc::unshare(flags) })?;
        write_file(SETGROUPS, b"deny")?;
        write_file(UID_MAP, &self.uid_map)?;
        write_file(GID_MAP, &self.gid_map)?;
        self.build_view()?;

        let slot = shared_status_slot()?;
        // SAFETY: fork in a single-threaded child; both sides only make syscalls.
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            init => relay_exit(init, slot),
        }

        // init of the new PID namespace
        // SAFETY: plain syscalls.
        unsafe {
            libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong);
        }
        mount_proc()?;
        // SAFETY: as above.
        match unsafe { libc::fork() } {
            -1 => return Err(io::Error::last_os_error()),
            0 => {}
            program => reap_as_init(program, slot),
        }

        self.rlimits.apply()
    }

    /// Cover the hidden roots and bind the kept directories back.
    fn build_view(&self) -> io::Result<()> {
        // SAFETY: every pointer is a NUL-terminated string owned by `self`
        // or a static.
        unsafe {
            check(libc::mount(
                std::ptr::null(),
                c(ROOT_DIR),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ))?;

            let mut fds = [-1; KEPT_DIRS];
            for (fd, (target, _)) in fds.iter_mut().zip(&self.rebind) {
                *fd = libc::open(target.as_ptr(), libc::O_PATH | libc::O_DIRECTORY | libc::O_CLOEXEC);
                check(*fd)?;
            }

            for root in &self.hide {
                check(libc::mount(
                    c(TMPFS),
                    root.as_ptr(),
                    c(TMPFS),
                    libc::MS_NOSUID | libc::MS_NODEV,
                    c(HIDE_OPTS).cast(),
                ))?;
            }

            for (fd, (target, mkdirs)) in fds.iter().zip(&self.rebind) {
                for dir in mkdirs {
                    if libc::mkdir(dir.as_ptr(), 0o755) != 0 {
                        let err = io::Error::last_os_error();
                        if err.raw_os_error() != Some(libc::EEXIST) {
                            return Err(err);
                        }
                    }
                }
                let mut link = [0u8; 32];
                check(libc::mount(
                    fd_link(*fd, &mut link),
                    target.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND | libc::MS_REC,
                    std::ptr::null(),
                ))?;
                libc::close(*fd);
            }

            check(libc::chdir(self.workdir.as_ptr()))
        }
    }
}

fn write_file(path: &[u8], data: &[u8]) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and `data` outlives the call.
    unsafe {
        let fd = libc::open(c(path), libc::O_WRONLY | libc::O_CLOEXEC);
        check(fd)?;
        let n = libc::write(fd, data.as_ptr().cast(), data.len());
        let err = io::Error::last_os_error();
        libc::close(fd);
        if n != data.len() as isize {
            return Err(err);
        }
    }
    Ok(())
}

/// `/proc/self/fd/<fd>` written into `buf`, NUL-terminated.
fn fd_link(fd: libc::c_int, buf: &mut [u8; 32]) -> *const libc::c_char {
    const PREFIX: &[u8] = b"/proc/self/fd/";
    buf[..PREFIX.len()].copy_from_slice(PREFIX);
    let mut digits = [0u8; 10];
    let mut n = fd.max(0) as u32;
    let mut len = 0;
    loop {
        digits[len] = b'0' + (n % 10) as u8;
        len += 1;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    for i in 0..len {
        buf[PREFIX.len() + i] = digits[len - 1 - i];
    }
    buf[PREFIX.len() + len] = 0;
    buf.as_ptr().cast()
}

/// A fresh procfs for the new PID namespace; an empty one if the kernel
/// refuses.
fn mount_proc() -> io::Result<()> {
    // SAFETY: static NUL-terminated strings.
    unsafe {
        let flags = libc::MS_NOSUID | libc::MS_NODEV | libc::MS_NOEXEC;
        if libc::mount(c(PROC), c(PROC_DIR), c(PROC), flags, std::ptr::null()) == 0 {
            return Ok(());
        }
        check(libc::mount(c(TMPFS), c(PROC_DIR), c(TMPFS), flags, c(HIDE_OPTS).cast()))
    }
}

/// One `int` shared by the relay and the namespace init across fork.
fn shared_status_slot() -> io::Result<*mut libc::c_int> {
    // SAFETY: anonymous shared mapping; checked for MAP_FAILED.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            std::mem::size_of::<libc::c_int>(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    let slot = ptr.cast::<libc::c_int>();
    // SAFETY: freshly mapped and large enough.
    unsafe { slot.write_volatile(NO_STATUS) };
    Ok(slot)
}

/// Close every descriptor from `first` on. The spawner waits for EOF on a
/// close-on-exec pipe, so nothing that outlives the exec may hold it.
fn close_from(first: libc::c_int) {
    // SAFETY: plain syscalls.
    unsafe {
        if libc::syscall(libc::SYS_close_range, first as libc::c_uint, libc::c_uint::MAX, 0) != 0 {
            for fd in first..1024 {
                libc::close(fd);
            }
        }
    }
}

fn wait_for(pid: libc::pid_t) -> libc::c_int {
    let mut status = 0;
    loop {
        // SAFETY: `status` is a valid out pointer.
        let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
        if rc == pid {
            return status;
        }
        if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return NO_STATUS;
        }
    }
}

/// The spawned process: wait for the namespace init, then end the same way
/// the program did.
fn relay_exit(init: libc::pid_t, slot: *mut libc::c_int) -> ! {
    // SAFETY: plain syscalls; `slot` stays mapped until exit.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        close_from(0);
        let init_status = wait_for(init);
        let program = slot.read_volatile();
        let status = if program != NO_STATUS { program } else { init_status };

        if libc::WIFSIGNALED(status) {
            let sig = libc::WTERMSIG(status);
            libc::signal(sig, libc::SIG_DFL);
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, sig);
            libc::sigprocmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
            libc::kill(libc::getpid(), sig);
            libc::_exit(128 + sig);
        }
        if libc::WIFEXITED(status) {
            libc::_exit(libc::WEXITSTATUS(status));
        }
        libc::_exit(127)
    }
}

/// Init of the program's PID namespace: reap everything, and leave as soon
/// as the program itself is gone, which takes its descendants down too.
fn reap_as_init(program: libc::pid_t, slot: *mut libc::c_int) -> ! {
    // SAFETY: plain syscalls; `slot` stays mapped until exit.
    unsafe {
        libc::signal(libc::SIGCHLD, libc::SIG_DFL);
        close_from(0);
        loop {
            let mut status = 0;
            let rc = libc::waitpid(-1, &mut status, 0);
            if rc == program {
                slot.write_volatile(status);
                libc::_exit(0);
            }
            if rc < 0 && io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
                libc::_exit(0);
            }
        }
    }
}

impl Sandbox for RlimitSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Rlimit
    }

    fn command(&self, program: &Path, scratch: &Path, limits: &Limits) -> Command {
        let program = canonical(&absolute(program));
        let scratch = canonical(&absolute(scratch));

        let mut cmd = Command::new(&program);
        cmd.current_dir(&scratch)
            .env_clear()
            .env("PATH", SANDBOX_PATH_ENV)
            .env("HOME", &scratch)
            .env("TMPDIR", &scratch)
            .env("LC_ALL", "C")
            .process_group(0);

        let hidden: Vec<PathBuf> = self
            .hidden
            .iter()
            .filter(|d| d.is_dir())
            .map(|d| canonical(d))
            .collect();
        let program_dir = program.parent().map_or_else(|| scratch.clone(), Path::to_path_buf);
        let layout = MountLayout::plan(&hidden, &[program_dir, scratch.clone()]);

        match Jail::new(limits, layout, &scratch) {
            Ok(jail) => {
                // SAFETY: `enter` only performs async-signal-safe syscalls on
                // data prepared here.
                unsafe {
                    cmd.pre_exec(move || jail.enter());
                }
            }
            Err(e) => {
                log::warn!("Cannot prepare sandbox for {}: {}", program.to_string_lossy(), e);
                // SAFETY: the hook only returns an error.
                unsafe {
                    cmd.pre_exec(|| Err(io::Error::from_raw_os_error(libc::EINVAL)));
                }
            }
        }
        cmd
    }

    fn decode_exit(&self, status: ExitStatus) -> RawExit {
        match (status.code(), status.signal()) {
            (Some(code), _) => RawExit::Code(code),
            (None, Some(sig)) => RawExit::Signal(sig),
            (None, None) => RawExit::Code(-1),
        }
    }

    fn wrapper_depth(&self) -> usize {
        2
    }
}

//---------------------------------------------------------
// nsjail backend

/// Delegates isolation to `nsjail` in one-shot mode.
#[derive(Debug, Clone)]
pub struct NsjailSandbox {
    binary: PathBuf,
    cgroups: bool,
}

impl NsjailSandbox {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            cgroups: false,
        }
    }

    /// Also bound memory and process count of the whole jail through
    /// cgroups. Needs a cgroup hierarchy nsjail may write to.
    pub fn with_cgroups(mut self, yes: bool) -> Self {
        self.cgroups = yes;
        self
    }

    fn mib_ceil(bytes: u64) -> u64 {
        bytes.div_ceil(1 << 20).max(1)
    }
}

impl Sandbox for NsjailSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Nsjail
    }

    fn command(&self, program: &Path, scratch: &Path, limits: &Limits) -> Command {
        let scratch_str = scratch.to_string_lossy();
        let mut cmd = Command::new(&self.binary);
        cmd.process_group(0);

        // no --chroot: the jail root is an empty tmpfs with only these mounted
        cmd.args(["--mode", "o", "--tmpfsmount", "/tmp", "--quiet"]);
        for dir in SYSTEM_DIRS.iter().filter(|d| Path::new(d).exists()) {
            cmd.arg("--bindmount_ro").arg(dir);
        }
        cmd.args(["--bindmount", "/dev/null"]);
        if let Some(dir) = program.parent() {
            cmd.arg("--bindmount_ro").arg(dir);
        }
        cmd.arg("--bindmount").arg(scratch);
        cmd.arg("--cwd").arg(scratch);

        cmd.arg("--rlimit_as")
            .arg(Self::mib_ceil(limits.address_space_bytes()).to_string());
        cmd.arg("--rlimit_cpu").arg(limits.cpu_secs_ceil().to_string());
        cmd.arg("--rlimit_fsize")
            .arg(Self::mib_ceil(limits.max_file_bytes).to_string());
        cmd.arg("--rlimit_nofile")
            .arg(limits.max_open_files.to_string());
        cmd.arg("--rlimit_nproc")
            .arg(limits.max_processes.to_string());
        cmd.args(["--rlimit_core", "0", "--max_cpus", "1"]);
        if self.cgroups {
            cmd.arg("--cgroup_mem_max").arg(limits.memory_bytes.to_string());
            cmd.arg("--cgroup_pids_max").arg(limits.max_processes.to_string());
        }

        // backstop only: the engine enforces the wall-clock bound itself
        let wall = limits.wall_time.as_secs() + 2;
        cmd.arg("--time_limit").arg(wall.to_string());

        if !limits.isolate_network {
            cmd.arg("--disable_clone_newnet");
        }
        cmd.arg("--env").arg(format!("PATH={}", SANDBOX_PATH_ENV));
        cmd.arg("--env").arg(format!("HOME={}", scratch_str));
        cmd.arg("--env").arg("LC_ALL=C");

        cmd.arg("--").arg(program);
        cmd
    }

    /// nsjail reports a signalled child as `128 + signal`.
    fn decode_exit(&self, status: ExitStatus) -> RawExit {
        match (status.code(), status.signal()) {
            (Some(code), _) if (129..=128 + 64).contains(&code) => RawExit::Signal(code - 128),
            (Some(code), _) => RawExit::Code(code),
            (None, Some(sig)) => RawExit::Signal(sig),
            (None, None) => RawExit::Code(-1),
        }
    }

    fn wrapper_depth(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn limits() -> Limits {
        Limits::from_config(&RunConfig::default())
    }

    #[test]
    fn cpu_seconds_round_up() {
        let mut l = limits();
        l.cpu_time = Duration::from_millis(1500);
        assert_eq!(l.cpu_secs_ceil(), 2);
        l.cpu_time = Duration::from_millis(1);
        assert_eq!(l.cpu_secs_ceil(), 1);
        l.cpu_time = Duration::ZERO;
        assert_eq!(l.cpu_secs_ceil(), 1);
    }

    #[test]
    fn nsjail_command_line() {
        let sb = NsjailSandbox::new("/usr/bin/nsjail");
        let mut l = limits();
        l.isolate_network = false;
        let cmd = sb.command(Path::new("/w/a.out"), Path::new("/w/scratch"), &l);
        let std_cmd = cmd.as_std();
        assert_eq!(std_cmd.get_program(), "/usr/bin/nsjail");
        let args: Vec<_> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        let after = |flag: &str| {
            let i = args.iter().position(|a| a == flag).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(after("--mode"), "o");
        assert_eq!(after("--cwd"), "/w/scratch");
        let pairs: Vec<_> = args.windows(2).map(|w| (w[0].as_str(), w[1].as_str())).collect();
        assert!(pairs.contains(&("--bindmount", "/w/scratch")));
        assert!(pairs.contains(&("--bindmount_ro", "/w")));
        assert!(!args.contains(&"--chroot".to_owned()));
        assert_eq!(after("--rlimit_as"), "512");
        assert_eq!(after("--rlimit_cpu"), "2");
        assert!(args.contains(&"--disable_clone_newnet".to_owned()));
        assert_eq!(args.last().unwrap(), "/w/a.out");
        assert_eq!(args[args.len() - 2], "--");

        assert!(!args.contains(&"--cgroup_mem_max".to_owned()));

        l.isolate_network = true;
        let cmd = sb.command(Path::new("/w/a.out"), Path::new("/w/scratch"), &l);
        assert!(!cmd
            .as_std()
            .get_args()
            .any(|a| a == "--disable_clone_newnet"));
    }

    #[test]
    fn nsjail_cgroup_limits() {
        let sb = NsjailSandbox::new("nsjail").with_cgroups(true);
        let cmd = sb.command(Path::new("/w/a.out"), Path::new("/w/scratch"), &limits());
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        let pairs: Vec<_> = args.windows(2).map(|w| (w[0].as_str(), w[1].as_str())).collect();
        assert!(pairs.contains(&("--cgroup_mem_max", "268435456")));
        assert!(pairs.contains(&("--cgroup_pids_max", "32")));
    }

    fn paths(v: &[&str]) -> Vec<PathBuf> {
        v.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn hidden_roots_are_covered_and_kept_dirs_bound_back() {
        let layout = MountLayout::plan(
            &paths(&[
                "/srv/scratch",
                "/srv/data",
                "/srv/scratch/nested",
                "/srv/scratch/w/t001/inner",
                "/",
            ]),
            &paths(&["/srv/scratch/w/build", "/srv/scratch/w/t001"]),
        );
        assert_eq!(layout.hide, paths(&["/srv/data", "/srv/scratch"]));
        assert_eq!(
            layout.rebind,
            [
                RebindLayout {
                    target: "/srv/scratch/w/build".into(),
                    mkdirs: paths(&["/srv/scratch/w", "/srv/scratch/w/build"]),
                },
                RebindLayout {
                    target: "/srv/scratch/w/t001".into(),
                    mkdirs: paths(&["/srv/scratch/w", "/srv/scratch/w/t001"]),
                },
            ]
        );
    }

    #[test]
    fn kept_dirs_outside_hidden_roots_stay_as_they_are() {
        let layout = MountLayout::plan(&paths(&["/srv/data"]), &paths(&["/tmp/x", "/tmp/x/t001"]));
        assert_eq!(layout.hide, paths(&["/srv/data"]));
        assert!(layout.rebind.is_empty());

        let layout = MountLayout::plan(&[], &paths(&["/tmp/x"]));
        assert!(layout.hide.is_empty());
        assert!(layout.rebind.is_empty());
    }

    #[test]
    fn hidden_dirs_become_absolute() {
        let sb = RlimitSandbox::new().hiding(["rel/data".into(), PathBuf::new(), "/abs".into()]);
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(sb.hidden(), [cwd.join("rel/data"), PathBuf::from("/abs")]);
    }

    #[test]
    fn fd_link_is_nul_terminated() {
        let mut buf = [0xffu8; 32];
        let ptr = fd_link(7, &mut buf);
        let s = unsafe { std::ffi::CStr::from_ptr(ptr) };
        assert_eq!(s.to_str().unwrap(), "/proc/self/fd/7");

        let ptr = fd_link(1203, &mut buf);
        let s = unsafe { std::ffi::CStr::from_ptr(ptr) };
        assert_eq!(s.to_str().unwrap(), "/proc/self/fd/1203");
    }

    #[test]
    fn nsjail_decodes_signalled_children() {
        let sb = NsjailSandbox::new("nsjail");
        assert_eq!(sb.decode_exit(ExitStatus::from_raw(0)), RawExit::Code(0));
        assert_eq!(sb.decode_exit(ExitStatus::from_raw(3 << 8)), RawExit::Code(3));
        assert_eq!(sb.decode_exit(ExitStatus::from_raw(139 << 8)), RawExit::Signal(11));
        assert_eq!(sb.decode_exit(ExitStatus::from_raw(9)), RawExit::Signal(9));

        let rl = RlimitSandbox::new();
        assert_eq!(rl.decode_exit(ExitStatus::from_raw(139 << 8)), RawExit::Code(139));
        assert_eq!(rl.decode_exit(ExitStatus::from_raw(11)), RawExit::Signal(11));
    }
}
