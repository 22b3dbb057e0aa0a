//! QEMU log tailing
//!
//! QEMU writes its own diagnostics to the file given by `-D`. The tailer
//! replays new lines into our log under the `qemu` target and remembers how
//! far it got, so a restarted daemon resumes where the previous one stopped.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::hypervisor::persist::LogFileState;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TailState {
    name: PathBuf,
    offset: u64,
    closed: bool,
}

#[derive(Debug, Clone)]
pub struct QemuLogFile {
    state: Arc<Mutex<TailState>>,
    poll_interval: Duration,
}

impl QemuLogFile {
    pub fn new(name: impl Into<PathBuf>) -> Self {
        Self::from_state(LogFileState {
            name: name.into(),
            offset: 0,
        })
    }

    pub fn from_state(state: LogFileState) -> Self {
        Self {
            state: Arc::new(Mutex::new(TailState {
                name: state.name,
                offset: state.offset,
                closed: false,
            })),
            poll_interval: POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> LogFileState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        LogFileState {
            name: state.name.clone(),
            offset: state.offset,
        }
    }

    pub fn name(&self) -> PathBuf {
        self.state().name
    }

    /// Stop tailing at the next end of file.
    pub fn close(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed = true;
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .closed
    }

    fn advance(&self, n: u64) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offset += n;
    }

    pub fn watch(&self) -> JoinHandle<()> {
        let tail = self.clone();
        tokio::spawn(async move { tail.run().await })
    }

    async fn run(&self) {
        let LogFileState { name, .. } = self.state();
        debug!(file = %name.display(), "watching qemu log");
        loop {
            if let Err(e) = self.drain(&name).await {
                debug!(file = %name.display(), error = %e, "qemu log not readable yet");
            }
            if self.is_closed() {
                debug!(file = %name.display(), "stop watching qemu log");
                return;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Log every complete line past the saved offset.
    async fn drain(&self, name: &Path) -> std::io::Result<()> {
        let mut file = tokio::fs::File::open(name).await?;
        file.seek(std::io::SeekFrom::Start(self.state().offset)).await?;
        let mut reader = BufReader::new(file);
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            // A line without its newline is still being written.
            if n == 0 || !line.ends_with('\n') {
                return Ok(());
            }
            self.advance(n as u64);
            let text = line.trim_end();
            if !text.is_empty() {
                info!(target: "qemu", "qemu log: {}", text);
            }
        }
    }
}
