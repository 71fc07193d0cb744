//! Terminal and per-session file logging.
//!
//! The tracing subscriber is process-wide, so it is installed once with a
//! swappable file output. Each session attaches its own log file for as
//! long as it holds the returned [`SessionLog`]; with no session attached,
//! file output goes nowhere.

use std::{
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{
        Mutex, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    reload,
    util::SubscriberInitExt,
};

type FileLayer = fmt::Layer<
    Registry,
    fmt::format::DefaultFields,
    fmt::format::Format<fmt::format::Full, fmt::time::ChronoUtc>,
    BoxMakeWriter,
>;

static SUBSCRIBER: OnceLock<Result<Subscriber, String>> = OnceLock::new();

struct Subscriber {
    _stdout: Mutex<WorkerGuard>,
    file_output: reload::Handle<FileLayer, Registry>,

    /// Session whose file currently receives events; 0 for none
    attached: Mutex<u64>,
    next_id: AtomicU64,
}

fn file_layer(writer: BoxMakeWriter) -> FileLayer {
    fmt::layer::<Registry>()
        .with_timer(fmt::time::ChronoUtc::rfc_3339())
        .with_writer(writer)
        .with_ansi(false)
}

fn detached() -> BoxMakeWriter {
    BoxMakeWriter::new(io::sink)
}

impl Subscriber {
    /// Install the global subscriber with file output detached.
    ///
    /// The level filter comes from `RUST_LOG` and defaults to `info`.
    fn install() -> Result<Self, String> {
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .map_err(|e| format!("Failed to set up logging env filter: {e}"))?;

        let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(io::stdout());
        let stdout_layer = fmt::layer()
            .with_timer(fmt::time::ChronoUtc::rfc_3339())
            .with_writer(stdout_writer)
            .with_target(false);

        let (file, file_output) = reload::Layer::new(file_layer(detached()));

        tracing_subscriber::registry()
            .with(file)
            .with(env_filter)
            .with(stdout_layer)
            .try_init()
            .map_err(|e| format!("Failed to initialize logging: {e}"))?;

        Ok(Self {
            _stdout: Mutex::new(stdout_guard),
            file_output,
            attached: Mutex::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    fn attach(&self, writer: BoxMakeWriter) -> Result<u64, String> {
        let mut attached = self
            .attached
            .lock()
            .map_err(|_| "Session log lock poisoned".to_string())?;
        self.file_output
            .modify(|layer| *layer = file_layer(writer))
            .map_err(|e| format!("Failed to attach session log: {e}"))?;
        *attached = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(*attached)
    }

    /// Detach the file output if `id` still owns it. A newer session that
    /// has since attached its own file keeps it.
    fn detach(&self, id: u64) {
        let Ok(mut attached) = self.attached.lock() else {
            return;
        };
        if *attached != id {
            return;
        }
        if self
            .file_output
            .modify(|layer| *layer = file_layer(detached()))
            .is_ok()
        {
            *attached = 0;
        }
    }
}

/// A session's log file, attached to the global subscriber.
///
/// Dropping it detaches the file and then flushes it, so nothing logged
/// afterwards reaches it.
#[must_use = "the log file is detached when this is dropped"]
pub struct SessionLog {
    id: u64,
    path: PathBuf,
    _file: WorkerGuard,
}

impl SessionLog {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SessionLog {
    fn drop(&mut self) {
        if let Some(Ok(subscriber)) = SUBSCRIBER.get() {
            subscriber.detach(self.id);
        }
    }
}

/// Set up terminal logging if needed and send file output to
/// `<op_dir>/logs/<op_name>.log` until the returned guard is dropped.
pub fn init_logging(op_dir: &Path, op_name: &str) -> Result<SessionLog, String> {
    let subscriber = SUBSCRIBER
        .get_or_init(Subscriber::install)
        .as_ref()
        .map_err(Clone::clone)?;

    let log_dir = op_dir.join("logs");
    fs::create_dir_all(&log_dir).map_err(|e| format!("Failed to create log directory: {e}"))?;
    let path = log_dir.join(format!("{op_name}.log"));
    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| format!("Failed to open log file {path:?}: {e}"))?;

    let (writer, guard) = tracing_appender::non_blocking(logfile);
    let id = subscriber.attach(BoxMakeWriter::new(writer))?;
    Ok(SessionLog {
        id,
        path,
        _file: guard,
    })
}
