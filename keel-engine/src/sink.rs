//! Log sinks
//!
//! Every runner forwards output one line at a time, in production order,
//! to a [`LogSink`]. The execution context is the production sink; the
//! collecting sink captures output for diagnostics and tests.

use async_trait::async_trait;
use std::sync::Mutex;

/// Receives output lines as they are produced
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn line(&self, line: &str);
}

/// Sink that keeps every line in memory
#[derive(Debug, Default)]
pub struct CollectingSink {
    lines: Mutex<Vec<String>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the collected lines
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines.into_inner().unwrap_or_default()
    }
}

#[async_trait]
impl LogSink for CollectingSink {
    async fn line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_in_order() {
        let sink = CollectingSink::new();
        sink.line("first").await;
        sink.line("second").await;
        assert_eq!(sink.lines(), vec!["first", "second"]);
        assert_eq!(sink.into_lines().len(), 2);
    }
}
