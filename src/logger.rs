use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::Result;
use parking_lot::Mutex;

struct Sink {
    path: PathBuf,
    file: Mutex<File>,
}

static SINK: OnceLock<Sink> = OnceLock::new();

/// Writer handed to fern; it goes through the global sink so the
/// underlying file can be swapped out at runtime.
struct SinkWriter;

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match SINK.get() {
            Some(sink) => sink.file.lock().write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match SINK.get() {
            Some(sink) => sink.file.lock().flush(),
            None => Ok(()),
        }
    }
}

fn open(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global logger: stderr in the foreground, an appendable
/// file otherwise.
pub fn init(level: log::LevelFilter, file: Option<&Path>) -> Result<()> {
    let mut logger = fern::Dispatch::new().level(level).format(|out, message, record| {
        out.finish(format_args!(
            "[{}] - ({}) - {}",
            record.level(),
            record.file_static().unwrap_or("*"),
            message
        ))
    });

    logger = match file {
        None => logger.chain(io::stderr()),
        Some(path) => {
            let _ = SINK.set(Sink {
                path: path.to_path_buf(),
                file: Mutex::new(open(path)?),
            });

            logger.chain(fern::Output::writer(Box::new(SinkWriter), "\n"))
        }
    };

    logger.apply()?;

    Ok(())
}

/// Swap the file sink for a fresh handle, so an external log rotation
/// followed by SIGHUP picks up the new file.
pub fn reopen() -> Result<()> {
    if let Some(sink) = SINK.get() {
        *sink.file.lock() = open(&sink.path)?;
    }

    Ok(())
}
