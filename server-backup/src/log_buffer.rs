//! Per-unit, timestamp-headered log sink.
//!
//! Concurrent writers of one unit append whole lines under a lock, so the
//! unit's log never contains interleaved or partial lines. The buffer is
//! written to disk once, when the unit finishes.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[cfg(windows)]
const EOL: &str = "\r\n";
#[cfg(not(windows))]
const EOL: &str = "\n";

pub struct LogBuffer {
    label: String,
    verbose: bool,
    data: Mutex<Vec<u8>>,
}

impl LogBuffer {
    /// `label` names the unit in console output.
    pub fn new(label: impl Into<String>, verbose: bool) -> Self {
        Self {
            label: label.into(),
            verbose,
            data: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `[YYYY-MM-DD HH:MM:SS] line` plus a line terminator.
    pub fn add_header(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        let stamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let entry = format!("[{}] {}{}", stamp, line, EOL);

        let mut data = self.lock();
        if self.verbose {
            tracing::info!(unit = %self.label, "{}", line);
        }
        data.extend_from_slice(entry.as_bytes());
    }

    /// Drain a line-oriented stream, logging each line as it arrives.
    ///
    /// Returns the number of lines read. Invalid UTF-8 is replaced rather
    /// than rejected.
    pub async fn read_stream<R>(&self, stream: R) -> std::io::Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut lines = 0;

        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf).await? == 0 {
                break;
            }
            while matches!(buf.last(), Some(b'\n' | b'\r')) {
                buf.pop();
            }
            self.add_header(String::from_utf8_lossy(&buf));
            lines += 1;
        }

        Ok(lines)
    }

    /// Copy of the accumulated content.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.lock()).into_owned()
    }

    /// Append the whole buffer to `path`, creating parent directories.
    ///
    /// The lock is held for the whole call so no header lands mid-write.
    /// Blocking; call from `spawn_blocking` inside async code.
    pub fn flush(&self, path: &Path) -> std::io::Result<()> {
        let data = self.lock();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn assert_well_formed(line: &str) {
        assert!(line.starts_with('['), "missing timestamp: {line}");
        let stamp = &line[1..20];
        assert!(
            chrono::NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).is_ok(),
            "bad timestamp in: {line}"
        );
        assert_eq!(&line[20..22], "] ");
    }

    #[test]
    fn test_add_header_format() {
        let log = LogBuffer::new("unit", false);
        log.add_header("Archiving app");

        let content = log.contents();
        let line = content.lines().next().unwrap();
        assert_well_formed(line);
        assert!(line.ends_with("Archiving app"));
        assert!(content.ends_with(EOL));
    }

    #[test]
    fn test_concurrent_writers_produce_whole_lines() {
        const WRITERS: usize = 8;
        const LINES: usize = 250;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/unit.log");
        let log = Arc::new(LogBuffer::new("unit", false));

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..LINES {
                        log.add_header(format!("writer {w} line {i} payload-payload-payload"));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        log.flush(&path).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();

        assert_eq!(lines.len(), WRITERS * LINES);
        for line in lines {
            assert_well_formed(line);
            assert!(line.ends_with("payload-payload-payload"));
        }
    }

    #[tokio::test]
    async fn test_read_stream_headers_each_line() {
        let log = LogBuffer::new("unit", false);
        let input: &[u8] = b"  adding: app/index.php (deflated 61%)\r\n  adding: app/.env\npartial";

        let count = log.read_stream(input).await.unwrap();
        assert_eq!(count, 3);

        let content = log.contents();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("adding: app/index.php (deflated 61%)"));
        assert!(lines[2].ends_with("] partial"));
    }

    #[test]
    fn test_flush_appends() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("run.log");
        std::fs::write(&path, "earlier run\n").unwrap();

        let log = LogBuffer::new("run", false);
        log.add_header("second run");
        log.flush(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("earlier run\n"));
        assert!(written.trim_end().ends_with("second run"));
    }
}
