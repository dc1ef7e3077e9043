use anyhow::Result;
use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

pub const LOG_FILE: &str = "HundredLineFix.log";
/// Where the log is moved once it reaches [`MAX_LOG_SIZE`]
pub const ROTATED_LOG_FILE: &str = "HundredLineFix.1.log";
pub const MAX_LOG_SIZE: u64 = 10 * 1024 * 1024;

/// Log to a fresh `HundredLineFix.log` in `exe_dir`. Lines are written from a background
/// worker which stops when the returned guard is dropped.
pub fn setup_logging(exe_dir: impl AsRef<Path>) -> Result<non_blocking::WorkerGuard> {
    let exe_dir = exe_dir.as_ref();
    let f = RotatingFile::create(
        exe_dir.join(LOG_FILE),
        exe_dir.join(ROTATED_LOG_FILE),
        MAX_LOG_SIZE,
    )?;
    let (file_writer, guard) = non_blocking(f);

    let level = if cfg!(debug_assertions) {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(file_layer)
        .with(filter)
        .try_init()?;

    Ok(guard)
}

/// A log file capped at `max_size` bytes. When a write would go past the cap the file is
/// moved to `rotated` (replacing the previous one) and a new file is started.
pub struct RotatingFile {
    path: PathBuf,
    rotated: PathBuf,
    max_size: u64,
    file: io::BufWriter<fs::File>,
    size: u64,
}

impl RotatingFile {
    /// Start a new log at `path`, truncating whatever the previous run left.
    pub fn create(path: PathBuf, rotated: PathBuf, max_size: u64) -> io::Result<Self> {
        let file = io::BufWriter::new(fs::File::create(&path)?);
        Ok(Self {
            path,
            rotated,
            max_size,
            file,
            size: 0,
        })
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        fs::rename(&self.path, &self.rotated)?;
        self.file = io::BufWriter::new(fs::File::create(&self.path)?);
        self.size = 0;
        Ok(())
    }
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.size > 0 && self.size + buf.len() as u64 > self.max_size {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.size += written as u64;
        Ok(written)
    }
    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
