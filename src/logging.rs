//! Tracing setup and the per-iteration log file.
//!
//! Console output goes through the usual `fmt` layer. A second layer writes
//! into an [`IterationLogRouter`], which forwards to whichever iteration log
//! file is currently open and drops events while none is.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

type Slot = Arc<Mutex<Option<File>>>;

/// Shared handle to the currently open iteration log file.
#[derive(Clone, Default)]
pub struct IterationLogRouter {
    slot: Slot,
}

impl IterationLogRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create `path` and route log output into it until the returned guard
    /// is dropped.
    pub fn open(&self, path: &Path) -> io::Result<IterationLogGuard> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut slot = self.slot.lock().map_err(|_| poisoned())?;
        *slot = Some(file);
        Ok(IterationLogGuard {
            slot: self.slot.clone(),
            path: path.to_path_buf(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }
}

/// Keeps an iteration log file open; closing happens on drop.
pub struct IterationLogGuard {
    slot: Slot,
    path: PathBuf,
}

impl IterationLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IterationLogGuard {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            if let Some(mut file) = slot.take() {
                let _ = file.flush();
            }
        }
    }
}

pub struct IterationLogWriter {
    slot: Slot,
}

impl Write for IterationLogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut slot = self.slot.lock().map_err(|_| poisoned())?;
        match slot.as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut slot = self.slot.lock().map_err(|_| poisoned())?;
        match slot.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for IterationLogRouter {
    type Writer = IterationLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        IterationLogWriter {
            slot: self.slot.clone(),
        }
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "iteration log lock poisoned")
}

/// Install the global subscriber: env filter (`RUST_LOG` wins over the
/// configured level), console layer, and the iteration file layer.
pub fn init(config: &LoggingConfig) -> IterationLogRouter {
    let router = IterationLogRouter::new();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));

    let json_console = config.json.then(|| tracing_subscriber::fmt::layer().json());
    let text_console = (!config.json).then(|| tracing_subscriber::fmt::layer());
    let iteration_file = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(router.clone());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json_console)
        .with(text_console)
        .with(iteration_file)
        .try_init();
    router
}
