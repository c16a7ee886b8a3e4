use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    Io {
        op: &'static str,
        path: PathBuf,
        detail: String,
    },
    Process {
        program: String,
        detail: String,
    },
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { op, path, detail } => {
                write!(f, "io error: {op} {} ({detail})", path.display())
            }
            Self::Process { program, detail } => write!(f, "process error: {program} ({detail})"),
        }
    }
}

impl std::error::Error for AdapterError {}

fn io_error(op: &'static str, path: &Path, err: &std::io::Error) -> AdapterError {
    AdapterError::Io {
        op,
        path: path.to_path_buf(),
        detail: err.to_string(),
    }
}

pub trait Fs: Send + Sync {
    fn read_text(&self, root: &Path, path: &Path) -> Result<String, AdapterError>;
    fn exists(&self, root: &Path, path: &Path) -> bool;
    /// Last modification as unix seconds; `None` when the platform has none.
    fn modified_secs(&self, root: &Path, path: &Path) -> Result<Option<u64>, AdapterError>;
}

pub trait FsWrite: Send + Sync {
    fn write_text(&self, root: &Path, path: &Path, content: &str) -> Result<(), AdapterError>;
}

pub trait ProcessRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String], root: &Path) -> Result<i32, AdapterError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealFs;

impl Fs for RealFs {
    fn read_text(&self, root: &Path, path: &Path) -> Result<String, AdapterError> {
        let target = root.join(path);
        fs::read_to_string(&target).map_err(|err| io_error("read", &target, &err))
    }

    fn exists(&self, root: &Path, path: &Path) -> bool {
        root.join(path).exists()
    }

    fn modified_secs(&self, root: &Path, path: &Path) -> Result<Option<u64>, AdapterError> {
        let target = root.join(path);
        let meta = fs::metadata(&target).map_err(|err| io_error("stat", &target, &err))?;
        Ok(meta
            .modified()
            .ok()
            .and_then(|at| at.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs()))
    }
}

impl FsWrite for RealFs {
    fn write_text(&self, root: &Path, path: &Path, content: &str) -> Result<(), AdapterError> {
        let target = root.join(path);
        fs::write(&target, content).map_err(|err| io_error("write", &target, &err))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealProcessRunner;

impl ProcessRunner for RealProcessRunner {
    fn run(&self, program: &str, args: &[String], root: &Path) -> Result<i32, AdapterError> {
        let status = Command::new(program)
            .args(args)
            .current_dir(root)
            .status()
            .map_err(|err| AdapterError::Process {
                program: program.to_string(),
                detail: err.to_string(),
            })?;
        status.code().ok_or_else(|| AdapterError::Process {
            program: program.to_string(),
            detail: "terminated by signal".to_string(),
        })
    }
}
