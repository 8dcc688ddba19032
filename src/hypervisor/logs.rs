//! Log and metrics FIFO drains.
//!
//! The hypervisor writes its logger and metrics output into named pipes. A
//! drain task per pipe copies every line into a durable file until it is
//! cancelled. While no writer is attached the drain sleeps for the poll
//! interval between reads.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Drain tasks belonging to one VM.
#[derive(Debug)]
pub struct LogTasks {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    files: Vec<PathBuf>,
}

impl LogTasks {
    /// Empty set that will write into `files`.
    pub fn new(files: Vec<PathBuf>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Mutex::new(Vec::new()),
            files,
        }
    }

    /// Cancellation signal for a new drain.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Track a spawned drain.
    pub fn push(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    /// Durable files the drains write.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Signal every drain to stop without waiting.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Cancel the drains and join them, aborting any still running after
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for mut task in tasks {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                tracing::warn!("log drain did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Create a FIFO at `path`, reusing one that already exists.
pub fn make_fifo(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    if unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Spawn a task copying lines from `fifo` into `output` until `shutdown`
/// flips to true.
pub fn spawn_drain(
    fifo: PathBuf,
    output: PathBuf,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match drain(&fifo, &output, poll_interval, &mut shutdown).await {
            Ok(()) => tracing::debug!(fifo = %fifo.display(), "log drain stopped"),
            Err(e) => {
                tracing::warn!(fifo = %fifo.display(), output = %output.display(), error = %e, "log drain failed")
            }
        }
    })
}

async fn drain(
    fifo: &Path,
    output: &Path,
    poll_interval: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    // Opening the read side first lets the hypervisor's writer open succeed
    let receiver = pipe::OpenOptions::new().open_receiver(fifo)?;
    let mut reader = BufReader::new(receiver);
    let mut sink = open_append(output).await?;
    let mut line = Vec::with_capacity(512);

    loop {
        if *shutdown.borrow() {
            return Ok(());
        }

        line.clear();
        let read = tokio::select! {
            res = reader.read_until(b'\n', &mut line) => res?,
            _ = shutdown.changed() => return Ok(()),
        };

        if read == 0 {
            // No writer attached
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => return Ok(()),
            }
            continue;
        }

        // Rotation renames the file out from under us
        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            sink = open_append(output).await?;
        }
        sink.write_all(&line).await?;
        sink.flush().await?;
    }
}

async fn open_append(path: &Path) -> io::Result<tokio::fs::File> {
    OpenOptions::new().create(true).append(true).open(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    async fn wait_for_contents(path: &Path, expected: &str) -> String {
        for _ in 0..100 {
            let contents = fs::read_to_string(path).unwrap_or_default();
            if contents.contains(expected) {
                return contents;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_make_fifo_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.fifo");

        make_fifo(&path).unwrap();
        make_fifo(&path).unwrap();
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_make_fifo_replaces_regular_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vm.fifo");
        fs::write(&path, "stale").unwrap();

        make_fifo(&path).unwrap();
        assert!(fs::symlink_metadata(&path).unwrap().file_type().is_fifo());
    }

    #[tokio::test]
    async fn test_drain_copies_lines_across_writers() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("vm.fifo");
        let output = dir.path().join("vm.log");
        make_fifo(&fifo).unwrap();

        let tasks = LogTasks::new(vec![output.clone()]);
        tasks.push(spawn_drain(
            fifo.clone(),
            output.clone(),
            Duration::from_millis(10),
            tasks.subscribe(),
        ));

        // Give the drain time to open the read side
        tokio::time::sleep(Duration::from_millis(50)).await;
        for msg in ["first line\n", "second line\n"] {
            let fifo = fifo.clone();
            tokio::task::spawn_blocking(move || {
                let mut writer = fs::OpenOptions::new().write(true).open(&fifo).unwrap();
                writer.write_all(msg.as_bytes()).unwrap();
            })
            .await
            .unwrap();
        }

        let contents = wait_for_contents(&output, "second line").await;
        assert_eq!(contents, "first line\nsecond line\n");

        tasks.shutdown(Duration::from_secs(1)).await;
        assert!(tasks.is_cancelled());
    }

    #[tokio::test]
    async fn test_drain_reopens_rotated_output() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("vm.fifo");
        let output = dir.path().join("vm.log");
        make_fifo(&fifo).unwrap();

        let tasks = LogTasks::new(vec![output.clone()]);
        tasks.push(spawn_drain(
            fifo.clone(),
            output.clone(),
            Duration::from_millis(10),
            tasks.subscribe(),
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let writer_fifo = fifo.clone();
        let mut writer = tokio::task::spawn_blocking(move || {
            fs::OpenOptions::new().write(true).open(&writer_fifo).unwrap()
        })
        .await
        .unwrap();

        writer.write_all(b"before\n").unwrap();
        wait_for_contents(&output, "before").await;
        fs::rename(&output, dir.path().join("vm.log.1")).unwrap();

        writer.write_all(b"after\n").unwrap();
        let contents = wait_for_contents(&output, "after").await;
        assert_eq!(contents, "after\n");

        drop(writer);
        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_drain() {
        let dir = TempDir::new().unwrap();
        let fifo = dir.path().join("idle.fifo");
        let output = dir.path().join("idle.log");
        make_fifo(&fifo).unwrap();

        let tasks = LogTasks::new(vec![output.clone()]);
        tasks.push(spawn_drain(
            fifo,
            output.clone(),
            Duration::from_secs(60),
            tasks.subscribe(),
        ));
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), tasks.shutdown(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(output.exists());
    }
}
