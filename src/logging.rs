use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "cosmos.log";

/// Appends formatted events to the log file, optionally echoing them to stderr.
#[derive(Clone)]
pub(crate) struct FileMakeWriter {
    file: Arc<Mutex<File>>,
    echo_stderr: bool,
}

impl FileMakeWriter {
    pub fn open(path: &Path, echo_stderr: bool) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            echo_stderr,
        })
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriter {
            file: self.file.clone(),
            echo_stderr: self.echo_stderr,
        }
    }
}

pub(crate) struct FileWriter {
    file: Arc<Mutex<File>>,
    echo_stderr: bool,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Ok(mut file) = self.file.lock() {
            file.write_all(buf)?;
        }
        if self.echo_stderr {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Ok(mut file) = self.file.lock() {
            file.flush()?;
        }
        if self.echo_stderr {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Install the global subscriber. `verbose` forces debug level and stderr echo.
pub(crate) fn init(data_dir: &Path, level: Level, verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { level };
    let writer = FileMakeWriter::open(&data_dir.join(LOG_DIR).join(LOG_FILE), verbose)?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(false)
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
