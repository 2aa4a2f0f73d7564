use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Size-capped log writer for a single child stream. Rotated files are
/// shifted to `<name>.0 .. <name>.N`, newest first; the oldest is dropped.
pub struct RotatingLogWriter {
    path: PathBuf,
    max_size: u64,
    keep: usize,
    file: File,
    size: u64,
}

impl RotatingLogWriter {
    pub fn new(dir: &PathBuf, file_name: &str, max_size: u64, keep: usize) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log dir {:?}", dir))?;
        let path = dir.join(file_name);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        let size = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok(Self { path, max_size: max_size.max(1024), keep: keep.max(1), file, size })
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        let len = line.len() as u64 + 1;
        if self.size + len > self.max_size {
            self.rotate()?;
        }
        writeln!(self.file, "{}", line)?;
        self.size += len;
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.file.flush().ok();

        // Shift name.(i) -> name.(i+1), dropping the oldest
        let rotated = |idx: usize| {
            let mut os = self.path.clone().into_os_string();
            os.push(format!(".{}", idx));
            PathBuf::from(os)
        };
        let _ = std::fs::remove_file(rotated(self.keep - 1));
        for idx in (0..self.keep - 1).rev() {
            let from = rotated(idx);
            if from.exists() {
                let _ = std::fs::rename(&from, rotated(idx + 1));
            }
        }
        std::fs::rename(&self.path, rotated(0))
            .with_context(|| format!("Failed to rotate log {:?}", self.path))?;

        self.file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = 0;
        Ok(())
    }
}

/// Drain a child stream into a rotating log file until EOF.
pub async fn pump_stream<R>(reader: R, mut writer: RotatingLogWriter)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(err) = writer.write_line(&line) {
                    tracing::warn!("Dropping child log line: {}", err);
                }
            }
            Ok(None) => break,
            Err(err) => {
                tracing::debug!("Child log stream closed: {}", err);
                break;
            }
        }
    }
}
