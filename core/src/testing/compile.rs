use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use fsutil::WalkOpt;
use tokio::process::Command;

use super::runner::{collect, read_capped, LaunchError};
use super::sandbox::kill_process_group;
use crate::config::CompileConfig;
use crate::stage::defines_main;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const TRUNCATION_MARKER: &str = "\n... (diagnostics truncated)";

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("Compilation failed (exit status {})", display_code(.code))]
    Rejected {
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("Compilation did not finish within {}ms", .limit.as_millis())]
    TimedOut { limit: Duration, diagnostics: String },

    #[error("Cannot collect sources: {0}")]
    Sources(#[from] fsutil::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Toolchain '{}' is unavailable: {reason}", .compiler.to_string_lossy())]
    Unavailable { compiler: PathBuf, reason: String },
}

fn display_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".into(), |c| c.to_string())
}

impl CompileError {
    pub fn diagnostics(&self) -> String {
        match self {
            Self::Rejected { diagnostics, .. } | Self::TimedOut { diagnostics, .. } => {
                diagnostics.clone()
            }
            other => other.to_string(),
        }
    }
}

/// What gets handed to the compiler for one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    pub main: PathBuf,
    pub sources: Vec<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    /// Other `.c` files that define their own `main`; left out of the link.
    pub skipped_mains: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compiled {
    pub artifact: PathBuf,
    /// Warnings, possibly empty.
    pub diagnostics: String,
}

/// A single fixed compiler configuration.
#[derive(Debug, Clone)]
pub struct CompileStage {
    compiler: PathBuf,
    flags: Vec<String>,
    libs: Vec<String>,
    timeout: Duration,
    diagnostics_cap: usize,
    recursive: bool,
}

impl CompileStage {
    pub fn from_config(cfg: &CompileConfig) -> Self {
        Self {
            compiler: cfg.compiler.clone(),
            flags: cfg.flags.clone(),
            libs: cfg.libs.clone(),
            timeout: cfg.timeout(),
            diagnostics_cap: cfg.diagnostics_max_bytes,
            recursive: cfg.recursive,
        }
    }

    pub fn compiler(&self) -> &Path {
        &self.compiler
    }

    /// First line of `<compiler> --version`.
    pub async fn probe(&self) -> Result<String, CompileError> {
        let unavailable = |reason: String| CompileError::Unavailable {
            compiler: self.compiler.clone(),
            reason,
        };
        let run = Command::new(&self.compiler)
            .arg("--version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let out = tokio::time::timeout(PROBE_TIMEOUT, run)
            .await
            .map_err(|_| unavailable("--version did not answer".into()))?
            .map_err(|e| unavailable(e.to_string()))?;
        if !out.status.success() {
            return Err(unavailable(format!("--version exited with {}", out.status)));
        }
        let version = String::from_utf8_lossy(&out.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_owned();
        Ok(version)
    }

    /// The designated main plus every other `.c` under `root` that does not
    /// define `main` itself. Include dirs are `root` and every directory
    /// holding a header.
    pub fn collect_sources(&self, root: &Path, main: &Path) -> Result<CompileUnit, CompileError> {
        let opt = WalkOpt {
            recursive: self.recursive,
            skip_hidden_dirs: true,
        };

        let mut sources = vec![main.to_owned()];
        let mut skipped_mains = Vec::new();
        for path in fsutil::find_files_with_ext(root, &["c"], opt)? {
            if path == main {
                continue;
            }
            if defines_main(&fsutil::read(&path)?) {
                skipped_mains.push(path);
            } else {
                sources.push(path);
            }
        }

        let mut include_dirs = vec![root.to_owned()];
        for header in fsutil::find_files_with_ext(root, &["h"], opt)? {
            if let Some(dir) = header.parent() {
                if !include_dirs.iter().any(|d| d == dir) {
                    include_dirs.push(dir.to_owned());
                }
            }
        }

        Ok(CompileUnit {
            main: main.to_owned(),
            sources,
            include_dirs,
            skipped_mains,
        })
    }

    pub fn command(&self, unit: &CompileUnit, output: &Path) -> Command {
        let mut cmd = Command::new(&self.compiler);
        cmd.args(&self.flags);
        for dir in &unit.include_dirs {
            cmd.arg("-I").arg(dir);
        }
        cmd.args(&unit.sources);
        cmd.arg("-o").arg(output);
        cmd.args(&self.libs);
        cmd
    }

    pub async fn compile(&self, unit: &CompileUnit, output: &Path) -> Result<Compiled, CompileError> {
        for skipped in &unit.skipped_mains {
            log::info!(
                "Leaving out {} (defines its own main)",
                skipped.to_string_lossy()
            );
        }
        if let Some(dir) = output.parent() {
            fsutil::mkdir_all(dir).map_err(LaunchError::from)?;
        }

        let mut cmd = self.command(unit, output);
        if let Some(dir) = unit.main.parent() {
            cmd.current_dir(dir);
        }
        let mut proc = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: self.compiler.clone(),
                source,
            })?;
        let pid = proc.id();
        let stdout = proc.stdout.take().ok_or(LaunchError::Pipe("stdout"))?;
        let stderr = proc.stderr.take().ok_or(LaunchError::Pipe("stderr"))?;
        let stdout_task = tokio::spawn(read_capped(stdout, self.diagnostics_cap));
        let stderr_task = tokio::spawn(read_capped(stderr, self.diagnostics_cap));

        let status = match tokio::time::timeout(self.timeout, proc.wait()).await {
            Err(_) => {
                // cc1, as, ld and friends live in the same group
                if let Some(pid) = pid {
                    kill_process_group(pid);
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(CompileError::TimedOut {
                    limit: self.timeout,
                    diagnostics: String::new(),
                });
            }
            Ok(status) => status.map_err(LaunchError::Wait)?,
        };

        let (mut transcript, stdout_cut) = collect(stdout_task).await;
        let (stderr, stderr_cut) = collect(stderr_task).await;
        transcript.push_str(&stderr);
        let diagnostics = if (stdout_cut || stderr_cut) && transcript.len() <= self.diagnostics_cap {
            format!("{}{}", transcript, TRUNCATION_MARKER)
        } else {
            truncate_diagnostics(&transcript, self.diagnostics_cap)
        };

        if status.success() {
            Ok(Compiled {
                artifact: output.to_owned(),
                diagnostics,
            })
        } else {
            Err(CompileError::Rejected {
                code: status.code(),
                diagnostics,
            })
        }
    }
}

/// Cut at a char boundary no later than `cap` bytes and append a marker.
pub fn truncate_diagnostics(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_owned();
    }
    let mut end = cap;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &s[..end], TRUNCATION_MARKER)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stage_with(compiler: impl Into<PathBuf>) -> CompileStage {
        CompileStage {
            compiler: compiler.into(),
            ..CompileStage::from_config(&CompileConfig::default())
        }
    }

    async fn cc_available() -> bool {
        let ok = stage_with("cc").probe().await.is_ok();
        if !ok {
            eprintln!("cc is not available; skipping");
        }
        ok
    }

    fn tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, body) in files {
            fsutil::write_with_mkdir(dir.path().join(path), body).unwrap();
        }
        dir
    }

    #[test]
    fn should_collect_sources_and_include_dirs() {
        let dir = tree(&[
            ("main.c", "int main(void) { return 0; }"),
            ("lib/util.c", "int twice(int x) { return 2 * x; }"),
            ("lib/util.h", "int twice(int x);"),
            ("old/main.c", "int  main (void) { return 1; }"),
            (".git/hook.c", "int x;"),
        ]);
        let root = dir.path();
        let unit = stage_with("cc")
            .collect_sources(root, &root.join("main.c"))
            .unwrap();

        assert_eq!(unit.sources, [root.join("main.c"), root.join("lib/util.c")]);
        assert_eq!(unit.skipped_mains, [root.join("old/main.c")]);
        assert_eq!(unit.include_dirs, [root.to_owned(), root.join("lib")]);
    }

    #[test]
    fn non_recursive_collects_top_level_only() {
        let dir = tree(&[("main.c", "int main(){}"), ("a.c", "int a;"), ("sub/b.c", "int b;")]);
        let mut stage = stage_with("cc");
        stage.recursive = false;
        let unit = stage
            .collect_sources(dir.path(), &dir.path().join("main.c"))
            .unwrap();
        assert_eq!(unit.sources.len(), 2);
    }

    #[test]
    fn should_build_fixed_command_line() {
        let unit = CompileUnit {
            main: "/s/main.c".into(),
            sources: vec!["/s/main.c".into(), "/s/u.c".into()],
            include_dirs: vec!["/s".into()],
            skipped_mains: vec![],
        };
        let cmd = stage_with("gcc").command(&unit, Path::new("/b/a.out"));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            [
                "-O2", "-std=c17", "-Wall", "-Wextra", "-I", "/s", "/s/main.c", "/s/u.c", "-o",
                "/b/a.out", "-lm"
            ]
        );
    }

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_diagnostics("short", 10), "short");
        let s = "ab\u{00e9}cd";
        assert_eq!(truncate_diagnostics(s, 3), format!("ab{}", TRUNCATION_MARKER));
        assert_eq!(truncate_diagnostics(s, 4), format!("ab\u{00e9}{}", TRUNCATION_MARKER));
    }

    #[tokio::test]
    async fn missing_compiler_is_unavailable() {
        let err = stage_with("/nonexistent/cc").probe().await.unwrap_err();
        assert!(matches!(err, CompileError::Unavailable { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn hanging_compiler_times_out() {
        let dir = tree(&[("main.c", "int main(){}")]);
        let fake = dir.path().join("fake-cc");
        std::fs::write(&fake, "#!/bin/sh\nsleep 5\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut stage = stage_with(&fake);
        stage.timeout = Duration::from_millis(200);
        let unit = stage
            .collect_sources(dir.path(), &dir.path().join("main.c"))
            .unwrap();
        let started = std::time::Instant::now();
        let err = stage
            .compile(&unit, &dir.path().join("out/a.out"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::TimedOut { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn noisy_compiler_output_is_bounded() {
        let dir = tree(&[("main.c", "int main(){}")]);
        let fake = dir.path().join("fake-cc");
        std::fs::write(
            &fake,
            "#!/bin/sh\nhead -c 20000000 /dev/zero | tr '\\0' e >&2\necho warning\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut stage = stage_with(&fake);
        stage.diagnostics_cap = 1000;
        let unit = stage
            .collect_sources(dir.path(), &dir.path().join("main.c"))
            .unwrap();
        let err = stage
            .compile(&unit, &dir.path().join("out/a.out"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Rejected { code: Some(1), .. }), "{err:?}");
        let diagnostics = err.diagnostics();
        assert!(diagnostics.len() <= 1000 + TRUNCATION_MARKER.len());
        assert!(diagnostics.ends_with(TRUNCATION_MARKER));
        assert!(diagnostics.starts_with("warning\neee"));
    }

    #[tokio::test]
    async fn should_compile_multi_file_program() {
        if !cc_available().await {
            return;
        }
        let dir = tree(&[
            (
                "main.c",
                "#include <stdio.h>\n#include \"util.h\"\nint main(void) { printf(\"%d\\n\", twice(21)); return 0; }\n",
            ),
            ("lib/util.c", "#include \"util.h\"\nint twice(int x) { return 2 * x; }\n"),
            ("lib/util.h", "int twice(int x);\n"),
        ]);
        let stage = stage_with("cc");
        let unit = stage
            .collect_sources(dir.path(), &dir.path().join("main.c"))
            .unwrap();
        let out = dir.path().join("build/prog");
        let compiled = stage.compile(&unit, &out).await.unwrap();
        assert_eq!(compiled.artifact, out);

        let run = std::process::Command::new(&out).output().unwrap();
        assert_eq!(String::from_utf8_lossy(&run.stdout), "42\n");
    }

    #[tokio::test]
    async fn should_capture_diagnostics_on_failure() {
        if !cc_available().await {
            return;
        }
        let dir = tree(&[("main.c", "int main(void) { return undefined_name; }\n")]);
        let mut stage = stage_with("cc");
        stage.diagnostics_cap = 4096;
        let unit = stage
            .collect_sources(dir.path(), &dir.path().join("main.c"))
            .unwrap();
        let err = stage
            .compile(&unit, &dir.path().join("a.out"))
            .await
            .unwrap_err();
        assert!(matches!(err, CompileError::Rejected { .. }), "{err:?}");
        assert!(err.diagnostics().contains("undefined_name"), "{}", err.diagnostics());
    }
}
