//! Console rendering for bus traffic.
//!
//! Sinks attached to the in-memory bus render published events through a
//! [`TelemetryFormatter`]. Color output follows [`FormatterMode`]:
//! auto-detected from stderr TTY capability by default, forceable either
//! way for log files and CI.

use std::io::IsTerminal;

use crate::bus::BusMessage;

pub const LINE_COLOR: &str = "\x1b[35m";
pub const RESET_COLOR: &str = "\x1b[0m";

/// Color mode for rendered output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Detect TTY capability via `stderr.is_terminal()` on each render.
    #[default]
    Auto,
    /// Always emit ANSI color codes.
    Colored,
    /// Never emit ANSI color codes.
    Plain,
}

impl FormatterMode {
    #[must_use]
    pub fn is_colored(&self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

/// Renders one published message into a console line.
pub trait TelemetryFormatter: Send + Sync {
    fn render(&self, message: &BusMessage) -> String;
}

/// Plain text formatter with optional ANSI color.
#[derive(Debug, Default)]
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render(&self, message: &BusMessage) -> String {
        let line = format!(
            "[{}#{}] {} {}",
            message.key,
            message.event.sequence,
            message.event.event_type,
            message.event.payload
        );
        if self.mode.is_colored() {
            format!("{LINE_COLOR}{line}{RESET_COLOR}")
        } else {
            line
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::types::{CorrelationId, EventType};
    use chrono::Utc;

    fn message() -> BusMessage {
        BusMessage {
            key: CorrelationId::from("run-t"),
            event: Event {
                id: "e1".into(),
                correlation_id: CorrelationId::from("run-t"),
                sequence: 3,
                event_type: EventType::NodeCompleted,
                payload: serde_json::json!({"node": "a"}),
                idempotency_key: "k".into(),
                created_at: Utc::now(),
            },
        }
    }

    #[test]
    fn plain_mode_has_no_ansi() {
        let rendered = PlainFormatter::with_mode(FormatterMode::Plain).render(&message());
        assert!(!rendered.contains('\x1b'));
        assert!(rendered.contains("run-t#3"));
        assert!(rendered.contains("node.completed"));
    }

    #[test]
    fn colored_mode_wraps_the_line() {
        let rendered = PlainFormatter::with_mode(FormatterMode::Colored).render(&message());
        assert!(rendered.starts_with(LINE_COLOR));
        assert!(rendered.ends_with(RESET_COLOR));
    }
}
