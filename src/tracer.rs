use anyhow::Context;
use serde_json::Value;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Simple file-based tracer for proxy diagnostics. One instance is shared
/// between the session thread and the two reader threads.
#[derive(Clone)]
pub struct FileTracer {
    file: Arc<Mutex<std::fs::File>>,
}

impl FileTracer {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn line(&self, text: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{text}");
        }
    }

    /// Trace one wire message with a direction label, e.g. `client ->`.
    pub fn wire(&self, label: &str, message: &Value) {
        if let Ok(text) = serde_json::to_string(message) {
            self.line(&format!("{label} {text}"));
        }
    }
}
