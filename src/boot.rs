use chrono::Local;
use log::LevelFilter;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
};

use env_logger::{Builder, Target};

use crate::config::LogSettings;

/// Multi-writer for logging to both file and stdout
struct DualWriter {
    file: File,
    stdout: io::Stdout,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stdout.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stdout.flush()?;
        Ok(())
    }
}

/// Where log records end up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogOptions {
    /// Keep the terminal quiet; records only go to the log file.
    pub quiet: bool,
    /// Include debug records (raw link traffic, phase transitions).
    pub verbose: bool,
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Initialize the bridge logger.
///
/// Records go to the configured log file and to stdout, or only to the file
/// in quiet mode. When the file cannot be opened the logger falls back to
/// stdout. `RUST_LOG` still overrides the level.
pub fn init_logger(settings: &LogSettings, options: LogOptions) {
    let file = settings.file.as_deref().and_then(|path| match open_log_file(path) {
        Ok(file) => Some(file),
        Err(err) => {
            eprintln!("Failed to open log file '{}': {err}", path.display());
            None
        }
    });

    let target: Box<dyn Write + Send> = match (file, options.quiet) {
        (Some(file), true) => Box::new(file),
        (Some(file), false) => Box::new(DualWriter {
            file,
            stdout: io::stdout(),
        }),
        (None, _) => Box::new(io::stdout()),
    };

    let level = if options.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(target))
        .filter_level(level)
        .parse_default_env();

    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
}
