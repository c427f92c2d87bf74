//! Snapshot rendering and persistence
//!
//! A snapshot is rendered as three header lines followed by a fixed-width
//! table. Column presence comes from the run configuration only, so every row
//! of a table has the same shape.

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local};

use crate::aggregate::ResultRecord;
use crate::config::{Destination, RunConfig};
use crate::error::Result;
use crate::privilege::{run_unprivileged, Credentials, Identity};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
/// Fits the longest x86_64 call name (23 characters)
const NAME_WIDTH: usize = 24;

/// Immutable point-in-time view of the benchmark
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Checkpoint index, increasing from 0
    pub index: u64,
    pub start_time: Option<DateTime<Local>>,
    pub current_time: DateTime<Local>,
    pub records: Vec<ResultRecord>,
}

/// Optional table columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub show_id: bool,
    pub show_average: bool,
}

impl From<&RunConfig> for TableLayout {
    fn from(config: &RunConfig) -> Self {
        Self {
            show_id: config.show_id,
            show_average: config.show_average,
        }
    }
}

/// Render a snapshot as text
pub fn render(snapshot: &Snapshot, layout: TableLayout) -> String {
    let mut out = String::new();

    match snapshot.start_time {
        Some(start) => {
            out.push_str(&format!("Experiment start: {}\n", start.format(TIME_FORMAT)));
            out.push_str(&format!(
                "Current time:     {}\n",
                snapshot.current_time.format(TIME_FORMAT)
            ));
            let elapsed = snapshot.current_time.signed_duration_since(start);
            out.push_str(&format!(
                "Seconds elapsed:  {:.3}\n",
                elapsed.num_milliseconds() as f64 / 1e3
            ));
        }
        None => {
            out.push_str("Experiment start: n/a\n");
            out.push_str(&format!(
                "Current time:     {}\n",
                snapshot.current_time.format(TIME_FORMAT)
            ));
        }
    }
    out.push('\n');

    if layout.show_id {
        out.push_str(&format!("{:>6} ", "NUM"));
    }
    out.push_str(&format!(
        "{:<width$} {:>12} {:>18}",
        "SYSCALL",
        "COUNT",
        "OVERHEAD(us)",
        width = NAME_WIDTH
    ));
    if layout.show_average {
        out.push_str(&format!(" {:>20}", "AVG. OVERHEAD(us)"));
    }
    out.push('\n');

    for record in &snapshot.records {
        if layout.show_id {
            out.push_str(&format!("{:>6} ", record.id.0));
        }
        out.push_str(&format!(
            "{:<width$} {:>12} {:>18.3}",
            record.name,
            record.count,
            record.overhead_us,
            width = NAME_WIDTH
        ));
        if layout.show_average {
            out.push_str(&format!(" {:>20.3}", record.average_us()));
        }
        out.push('\n');
    }
    out.push('\n');
    out
}

/// In-memory stream shared between a writer and an observer
#[doc(hidden)]
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap_or_else(PoisonError::into_inner)).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Persists rendered snapshots to the configured destination
pub struct ReportWriter {
    destination: Destination,
    tee: bool,
    layout: TableLayout,
    identity: Option<Identity>,
    creds: Arc<dyn Credentials>,
    stdout: Box<dyn Write + Send>,
    tee_stream: Box<dyn Write + Send>,
}

impl std::fmt::Debug for ReportWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportWriter")
            .field("destination", &self.destination)
            .field("tee", &self.tee)
            .field("layout", &self.layout)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl ReportWriter {
    /// Writer for `config`; file writes run as `identity`
    pub fn new(config: &RunConfig, identity: Option<Identity>, creds: Arc<dyn Credentials>) -> Self {
        Self {
            destination: config.destination.clone(),
            tee: config.tee,
            layout: TableLayout::from(config),
            identity,
            creds,
            stdout: Box::new(io::stdout()),
            tee_stream: Box::new(io::stderr()),
        }
    }

    /// Replace the stdout and tee streams
    pub fn with_streams(
        mut self,
        stdout: impl Write + Send + 'static,
        tee: impl Write + Send + 'static,
    ) -> Self {
        self.stdout = Box::new(stdout);
        self.tee_stream = Box::new(tee);
        self
    }

    /// Render and write one snapshot
    ///
    /// The tee copy is written first and independently of the primary
    /// destination, so a failing file write still leaves a copy on stderr.
    pub fn write(&mut self, snapshot: &Snapshot) -> Result<()> {
        let text = render(snapshot, self.layout);

        if self.tee {
            if let Err(e) = self
                .tee_stream
                .write_all(text.as_bytes())
                .and_then(|_| self.tee_stream.flush())
            {
                tracing::warn!("failed to tee snapshot {}: {}", snapshot.index, e);
            }
        }

        match self.destination.path_for(snapshot.index) {
            None => {
                self.stdout
                    .write_all(text.as_bytes())
                    .and_then(|_| self.stdout.flush())
                    .map_err(|source| crate::error::BenchError::Write {
                        path: "<stdout>".into(),
                        source,
                    })?;
            }
            Some(path) => {
                run_unprivileged(self.creds.as_ref(), self.identity, &path, || {
                    write_file(&path, &text)
                })?;
                tracing::debug!("snapshot {} written to {}", snapshot.index, path.display());
            }
        }
        Ok(())
    }
}

fn write_file(path: &Path, text: &str) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()
}
