//! # Events
//!
//! Everything a running pump reports to its host: log lines, progress and cycle completion. Events go
//! both to `tracing` and to an `EventSink` owned by the host application.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Parse the `log level` option of a pump. Unrecognized values fall back to the most verbose level.
    pub fn from_setting(setting: &str) -> Self {
        setting.parse().unwrap_or(LogLevel::Debug)
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            invalid => Err(format!("{invalid} is not a valid log level")),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PumpEvent {
    Log {
        pump: String,
        level: LogLevel,
        message: String,
    },
    /// Percent complete of the current cycle, in `[0, 100]`.
    Progress { pump: String, percent: f64 },
    Complete { pump: String, summary: String },
}

impl PumpEvent {
    pub fn pump(&self) -> &str {
        match self {
            PumpEvent::Log { pump, .. }
            | PumpEvent::Progress { pump, .. }
            | PumpEvent::Complete { pump, .. } => pump,
        }
    }
}

/// Receiver of pump events on the host side. Sending must never block a pump.
pub trait EventSink: Send + Sync {
    fn send(&self, event: PumpEvent);
}

/// Forwards events to an unbounded channel. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<PumpEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PumpEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: PumpEvent) {
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped, discarding pump event");
        }
    }
}

/// Discards every event. Used when a host only cares about `tracing` output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn send(&self, _event: PumpEvent) {}
}

/// Logger handed to the pieces of a pump. Messages below the pump's configured level are dropped;
/// everything else is recorded with `tracing` and forwarded to the sink.
#[derive(Clone)]
pub struct PumpLogger {
    pump: String,
    level: LogLevel,
    sink: std::sync::Arc<dyn EventSink>,
}

impl fmt::Debug for PumpLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpLogger")
            .field("pump", &self.pump)
            .field("level", &self.level)
            .finish()
    }
}

impl PumpLogger {
    pub fn new(pump: &str, level: LogLevel, sink: std::sync::Arc<dyn EventSink>) -> Self {
        Self {
            pump: pump.to_owned(),
            level,
            sink,
        }
    }

    pub fn pump(&self) -> &str {
        &self.pump
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn with_level(&self, level: LogLevel) -> Self {
        Self {
            level,
            ..self.clone()
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if level < self.level {
            return;
        }
        let message = message.into();
        let pump = self.pump.as_str();

        match level {
            LogLevel::Debug => debug!(pump, "{message}"),
            LogLevel::Info => info!(pump, "{message}"),
            LogLevel::Warning => warn!(pump, "{message}"),
            LogLevel::Error => error!(pump, "{message}"),
            LogLevel::Critical => error!(pump, critical = true, "{message}"),
        }

        self.sink.send(PumpEvent::Log {
            pump: self.pump.clone(),
            level,
            message,
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message)
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message)
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message)
    }

    pub fn critical(&self, message: impl Into<String>) {
        self.log(LogLevel::Critical, message)
    }

    pub fn progress(&self, percent: f64) {
        self.sink.send(PumpEvent::Progress {
            pump: self.pump.clone(),
            percent: percent.clamp(0.0, 100.0),
        });
    }

    pub fn complete(&self, summary: impl Into<String>) {
        self.sink.send(PumpEvent::Complete {
            pump: self.pump.clone(),
            summary: summary.into(),
        });
    }
}
