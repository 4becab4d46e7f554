//! Per-frontend audit trail
//!
//! Every line lands in the frontend's append-only `log` file and is copied
//! to each attached operator console.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::warn;

use crate::unix_now;

pub struct AuditLog {
    path: Option<PathBuf>,
    sinks: Mutex<Vec<UnboundedSender<String>>>,
}

impl AuditLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            sinks: Mutex::new(Vec::new()),
        }
    }

    /// Timestamp and record one line
    pub fn write(&self, line: impl AsRef<str>) {
        let line = format!("{} {}", unix_now(), line.as_ref().trim_end());

        if let Some(path) = &self.path {
            let result = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .and_then(|mut f| writeln!(f, "{}", line));
            if let Err(e) = result {
                warn!("Audit log {} unwritable: {}", path.display(), e);
            }
        }

        // closed consoles drop out here
        self.sinks.lock().retain(|tx| tx.send(line.clone()).is_ok());
    }

    /// Attach a console; it receives every line written from now on
    pub fn subscribe(&self) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        self.sinks.lock().push(tx);
        rx
    }

    pub fn subscribers(&self) -> usize {
        self.sinks.lock().len()
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").field("path", &self.path).finish()
    }
}
