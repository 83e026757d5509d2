use serde::{de::DeserializeOwned, Serialize};
use std::{
    fs::{self, File, OpenOptions, ReadDir},
    io::{BufReader, Write as _},
    path::{Component, Path, PathBuf},
};

pub mod error {
    use std::{io, path::PathBuf};

    pub type Result<T> = std::result::Result<T, self::Error>;

    type Msg = &'static str;

    #[derive(Debug, thiserror::Error)]
    pub enum Error {
        #[error("{0} ({1}): {2}")]
        SingleIO(Msg, PathBuf, #[source] io::Error),

        #[error("{0} (from='{1}', to='{2}'): {3}")]
        FromToIO(Msg, PathBuf, PathBuf, #[source] io::Error),

        #[error("Already exists: '{0}'")]
        AlreadyExists(PathBuf),

        #[error("Path escapes its root: '{0}'")]
        EscapingPath(PathBuf),

        #[error("Cannot serialize to JSON (dest='{0}'): {1}")]
        SerializeToJson(PathBuf, #[source] serde_json::Error),

        #[error("Cannot deserialize from JSON (src='{0}'): {1}")]
        DeserializeFromJson(PathBuf, #[source] serde_json::Error),
    }

    impl Error {
        pub fn path(&self) -> &std::path::Path {
            match self {
                Error::SingleIO(_, p, _)
                | Error::FromToIO(_, _, p, _)
                | Error::AlreadyExists(p)
                | Error::EscapingPath(p)
                | Error::SerializeToJson(p, _)
                | Error::DeserializeFromJson(p, _) => p,
            }
        }
    }
}
pub use error::{Error, Result};

pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    let dir = path.as_ref();
    fs::create_dir_all(dir).map_err(|e| Error::SingleIO("Cannot create dir", dir.to_owned(), e))
}

pub fn write<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    fs::write(&filepath, contents)
        .map_err(|e| Error::SingleIO("Cannot write file", filepath.as_ref().to_owned(), e))
}

pub fn write_with_mkdir<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    if let Some(dir) = filepath.as_ref().parent() {
        self::mkdir_all(dir)?;
    }
    self::write(filepath, contents)
}

/// Write `contents` to a file that must not exist yet.
///
/// The data goes to a sibling temp file first and is then hard-linked into
/// place, so readers never observe a half-written file and an existing
/// record is never replaced.
pub fn write_new_atomic<P, C>(filepath: P, contents: C) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    let filepath = filepath.as_ref();
    let dir = filepath.parent().unwrap_or(Path::new("."));
    self::mkdir_all(dir)?;

    if filepath.exists() {
        return Err(Error::AlreadyExists(filepath.to_owned()));
    }

    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        filepath
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default(),
        std::process::id()
    ));
    {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| Error::SingleIO("Cannot create temp file", tmp.clone(), e))?;
        f.write_all(contents.as_ref())
            .and_then(|_| f.sync_all())
            .map_err(|e| Error::SingleIO("Cannot write temp file", tmp.clone(), e))?;
    }

    let linked = fs::hard_link(&tmp, filepath);
    let _ = fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            Err(Error::AlreadyExists(filepath.to_owned()))
        }
        Err(e) => Err(Error::FromToIO(
            "Cannot move temp file into place",
            tmp,
            filepath.to_owned(),
            e,
        )),
    }
}

pub fn read(filepath: impl AsRef<Path>) -> Result<Vec<u8>> {
    fs::read(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

pub fn read_to_string(filepath: impl AsRef<Path>) -> Result<String> {
    fs::read_to_string(&filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.as_ref().to_owned(), e))
}

pub fn to_json_pretty<P, T>(filepath: P, data: &T) -> Result<String>
where
    P: AsRef<Path>,
    T: Serialize,
{
    serde_json::to_string_pretty(data)
        .map_err(|e| Error::SerializeToJson(filepath.as_ref().to_owned(), e))
}

pub fn write_json_with_mkdir<P, T>(filepath: P, data: &T) -> Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let s = self::to_json_pretty(&filepath, data)?;
    write_with_mkdir(filepath, s)
}

pub fn read_json_with_deserialize<P, T>(filepath: P) -> Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let filepath = filepath.as_ref();
    let f = File::open(filepath)
        .map_err(|e| Error::SingleIO("Cannot read file", filepath.to_owned(), e))?;
    serde_json::from_reader(BufReader::new(f))
        .map_err(|e| Error::DeserializeFromJson(filepath.to_owned(), e))
}

pub fn read_dir(dir: impl AsRef<Path>) -> Result<ReadDir> {
    fs::read_dir(&dir).map_err(|e| Error::SingleIO("Cannot read dir", dir.as_ref().to_owned(), e))
}

pub fn remove_dir_all(dir: impl AsRef<Path>) -> Result<()> {
    fs::remove_dir_all(&dir)
        .map_err(|e| Error::SingleIO("Cannot remove dir", dir.as_ref().to_owned(), e))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkOpt {
    pub recursive: bool,
    pub skip_hidden_dirs: bool,
}

impl Default for WalkOpt {
    fn default() -> Self {
        Self {
            recursive: true,
            skip_hidden_dirs: true,
        }
    }
}

/// List regular files under `dir` whose extension is in `exts`
/// (case-sensitive), sorted by path.
pub fn find_files_with_ext(dir: impl AsRef<Path>, exts: &[&str], opt: WalkOpt) -> Result<Vec<PathBuf>> {
    let mut res = Vec::new();
    self::walk_into(dir.as_ref(), exts, opt, &mut res)?;
    res.sort();
    Ok(res)
}

fn walk_into(dir: &Path, exts: &[&str], opt: WalkOpt, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in self::read_dir(dir)?.filter_map(std::result::Result::ok) {
        let Ok(ft) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if ft.is_dir() {
            let hidden = entry.file_name().to_string_lossy().starts_with('.');
            if opt.recursive && !(opt.skip_hidden_dirs && hidden) {
                self::walk_into(&path, exts, opt, out)?;
            }
            continue;
        }
        if !ft.is_file() {
            continue;
        }
        let matched = path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| exts.contains(&e));
        if matched {
            out.push(path);
        }
    }
    Ok(())
}

/// Normalize the path
/// ```
/// use fsutil::normalize_path;
/// use std::path::Path;
///
/// assert_eq!(normalize_path("./src/.hidden/././foo.c"), Path::new("src/.hidden/foo.c"));
/// assert_eq!(normalize_path("src/lib/../../main.c"), Path::new("main.c"));
/// assert_eq!(normalize_path("../foo/../hello"), Path::new("../hello"));
/// assert_eq!(normalize_path("/"), Path::new("/"));
/// assert_eq!(normalize_path("./foo/"), Path::new("foo"));
/// assert_eq!(normalize_path("./././."), Path::new("."));
/// ```
pub fn normalize_path(path: impl AsRef<Path>) -> PathBuf {
    let components = path.as_ref().components();
    let mut stack = Vec::with_capacity(components.size_hint().1.unwrap_or(4));
    for c in components {
        match c {
            Component::CurDir => (),
            Component::ParentDir
                if matches!(stack.last(), Some(Component::Normal(_))) =>
            {
                stack.pop();
            }
            _ => {
                stack.push(c);
            }
        }
    }
    if stack.is_empty() {
        stack.push(Component::CurDir);
    }
    stack.iter().collect()
}

/// Join a relative, untrusted path onto `root`, refusing anything that
/// would land outside of it.
/// ```
/// use fsutil::join_within;
/// use std::path::Path;
///
/// assert_eq!(join_within("/stage", "src/a.c").unwrap(), Path::new("/stage/src/a.c"));
/// assert!(join_within("/stage", "../etc/passwd").is_err());
/// assert!(join_within("/stage", "/etc/passwd").is_err());
/// ```
pub fn join_within(root: impl AsRef<Path>, rel: impl AsRef<Path>) -> Result<PathBuf> {
    let rel = rel.as_ref();
    let normalized = self::normalize_path(rel);
    let escapes = normalized
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(Error::EscapingPath(rel.to_owned()));
    }
    Ok(root.as_ref().join(normalized))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_new_atomic_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("stu1.json");

        write_new_atomic(&path, "{}").unwrap();
        assert_eq!(read_to_string(&path).unwrap(), "{}");

        let err = write_new_atomic(&path, "[]").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(read_to_string(&path).unwrap(), "{}");

        // no temp file is left behind
        let names: Vec<_> = read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn find_files_skips_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_with_mkdir(root.join("main.c"), "").unwrap();
        write_with_mkdir(root.join("lib/util.c"), "").unwrap();
        write_with_mkdir(root.join("lib/util.h"), "").unwrap();
        write_with_mkdir(root.join(".git/hooks/x.c"), "").unwrap();
        write_with_mkdir(root.join("notes.txt"), "").unwrap();

        let found = find_files_with_ext(root, &["c"], WalkOpt::default()).unwrap();
        assert_eq!(found, vec![root.join("lib/util.c"), root.join("main.c")]);

        let flat = find_files_with_ext(
            root,
            &["c", "h"],
            WalkOpt {
                recursive: false,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(flat, vec![root.join("main.c")]);
    }
}
