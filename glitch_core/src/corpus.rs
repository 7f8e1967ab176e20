use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Defines errors that can arise while persisting fuzzing cases.
///
/// These are fatal for a fuzzing loop: if interesting cases cannot be recorded, the
/// remaining iterations are pointless.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The target directory could not be created, or the path is not a directory.
    #[error("Failed to prepare directory {path:?}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A case file could not be written.
    #[error("Failed to write case file {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of [`CrashCorpus::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    /// A new file was written.
    Written(PathBuf),
    /// A file with the same fingerprint already existed and was left untouched.
    Duplicate(PathBuf),
}

impl Stored {
    pub fn path(&self) -> &Path {
        match self {
            Stored::Written(path) | Stored::Duplicate(path) => path,
        }
    }
}

fn ensure_dir(path: &Path) -> Result<(), CorpusError> {
    if path.exists() && !path.is_dir() {
        return Err(CorpusError::Directory {
            path: path.to_path_buf(),
            source: std::io::Error::new(ErrorKind::AlreadyExists, "exists but is not a directory"),
        });
    }
    fs::create_dir_all(path).map_err(|source| CorpusError::Directory {
        path: path.to_path_buf(),
        source,
    })
}

/// A content-addressed directory of crashing inputs.
///
/// Each case is stored as `crash_<fingerprint>.bin` holding the raw mutated bytes, so a
/// file can be fed straight back to the target to reproduce the crash. Files are
/// write-once: they are staged in a temp file inside the directory and linked into
/// place without clobbering, which also makes the directory safe to share between
/// concurrent workers.
#[derive(Debug, Clone)]
pub struct CrashCorpus {
    dir: PathBuf,
}

impl CrashCorpus {
    const FILE_PREFIX: &'static str = "crash_";
    const FILE_EXTENSION: &'static str = "bin";

    /// Opens (creating if needed) the crash directory at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CorpusError> {
        let dir = dir.into();
        ensure_dir(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path under which a case with this fingerprint is stored.
    pub fn path_for(&self, fingerprint: &str) -> PathBuf {
        self.dir.join(format!(
            "{}{fingerprint}.{}",
            Self::FILE_PREFIX,
            Self::FILE_EXTENSION
        ))
    }

    /// Persists `data` under `fingerprint`. Storing the same fingerprint twice is not an
    /// error; the second call reports [`Stored::Duplicate`].
    pub fn store(&self, data: &[u8], fingerprint: &str) -> Result<Stored, CorpusError> {
        let path = self.path_for(fingerprint);
        if path.exists() {
            return Ok(Stored::Duplicate(path));
        }

        let write_err = |source: std::io::Error| CorpusError::Write {
            path: path.clone(),
            source,
        };
        let mut staged = tempfile::NamedTempFile::new_in(&self.dir).map_err(write_err)?;
        staged
            .as_file_mut()
            .write_all(data)
            .and_then(|_| staged.as_file_mut().sync_all())
            .map_err(write_err)?;

        match staged.persist_noclobber(&path) {
            Ok(_) => Ok(Stored::Written(path.clone())),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
                Ok(Stored::Duplicate(path.clone()))
            }
            Err(e) => Err(write_err(e.error)),
        }
    }

    /// Crash files currently in the directory, sorted by name.
    pub fn entries(&self) -> Result<Vec<PathBuf>, CorpusError> {
        let read_err = |source: std::io::Error| CorpusError::Directory {
            path: self.dir.clone(),
            source,
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            let is_case = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| {
                    name.starts_with(Self::FILE_PREFIX)
                        && name.ends_with(&format!(".{}", Self::FILE_EXTENSION))
                });
            if is_case && path.is_file() {
                entries.push(path);
            }
        }
        entries.sort();
        Ok(entries)
    }
}

/// Writes one generated test case as `case_<index>_<fingerprint>.bin` under `dir`.
pub fn write_case(
    dir: &Path,
    index: usize,
    fingerprint: &str,
    data: &[u8],
) -> Result<PathBuf, CorpusError> {
    ensure_dir(dir)?;
    let path = dir.join(format!("case_{index:04}_{fingerprint}.bin"));
    fs::write(&path, data).map_err(|source| CorpusError::Write {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}
