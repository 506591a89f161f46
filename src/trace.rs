//! Structured trace sink
//!
//! When `--trace` is passed, the engine emits one JSON object per line for
//! every phase transition and every sandbox access decision. The event
//! schema is stable; functional tests consume it.

use crate::error::Result;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    PhaseStart {
        spec: String,
        phase: String,
    },
    PhaseComplete {
        spec: String,
        phase: String,
    },
    LuaCtxPackageAccess {
        spec: String,
        target: String,
        phase: String,
        allowed: bool,
    },
    LuaCtxProductAccess {
        spec: String,
        target: String,
        product: String,
        phase: String,
        allowed: bool,
    },
    LuaCtxAssetAccess {
        spec: String,
        target: String,
        phase: String,
        allowed: bool,
    },
    LuaCtxLoadenvSpecAccess {
        spec: String,
        target: String,
        phase: String,
        allowed: bool,
    },
}

enum Destination {
    Disabled,
    Stderr,
    File(BufWriter<File>),
}

/// Cloneable handle to the trace destination. All workers share one sink;
/// writes are line-atomic under the internal mutex.
#[derive(Clone)]
pub struct TraceSink {
    dest: Arc<Mutex<Destination>>,
}

impl TraceSink {
    pub fn disabled() -> Self {
        Self {
            dest: Arc::new(Mutex::new(Destination::Disabled)),
        }
    }

    pub fn stderr() -> Self {
        Self {
            dest: Arc::new(Mutex::new(Destination::Stderr)),
        }
    }

    pub fn file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(path)?;
        Ok(Self {
            dest: Arc::new(Mutex::new(Destination::File(BufWriter::new(file)))),
        })
    }

    /// Parse the CLI `--trace` value: empty means stderr, `file:PATH`
    /// writes JSONL to PATH.
    pub fn from_cli(value: Option<&str>) -> Result<Self> {
        match value {
            None => Ok(Self::disabled()),
            Some("") => Ok(Self::stderr()),
            Some(v) => match v.strip_prefix("file:") {
                Some(path) => Self::file(Path::new(path)),
                None => Err(crate::error::Error::Interface(format!(
                    "unrecognized --trace value '{}' (expected 'file:<path>')",
                    v
                ))),
            },
        }
    }

    pub fn emit(&self, event: TraceEvent) {
        let mut dest = self.dest.lock().unwrap_or_else(|p| p.into_inner());
        match &mut *dest {
            Destination::Disabled => {}
            Destination::Stderr => {
                if let Ok(line) = serde_json::to_string(&event) {
                    eprintln!("{}", line);
                }
            }
            Destination::File(writer) => {
                if let Ok(line) = serde_json::to_string(&event) {
                    let _ = writeln!(writer, "{}", line);
                    let _ = writer.flush();
                }
            }
        }
    }
}
