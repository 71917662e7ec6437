//! The trace-writer seam. Evaluation traces are a product of evaluation
//! (callers surface them alongside results), so the core writes to this
//! interface rather than to a logging sink directly.

/// TraceWriter receives evaluation traces. `info` lines summarize an
/// evaluation; `verbose` lines narrate every node visited.
pub trait TraceWriter {
    fn info(&mut self, message: &str);
    fn verbose(&mut self, message: &str);
    fn error(&mut self, message: &str);
}

/// NoopTraceWriter discards everything.
#[derive(Debug, Default)]
pub struct NoopTraceWriter;

impl TraceWriter for NoopTraceWriter {
    fn info(&mut self, _message: &str) {}
    fn verbose(&mut self, _message: &str) {}
    fn error(&mut self, _message: &str) {}
}

/// CollectingTraceWriter buffers info and error lines, optionally verbose
/// lines too. Used by callers that return the log with the result.
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    pub lines: Vec<String>,
    pub collect_verbose: bool,
}

impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TraceWriter for CollectingTraceWriter {
    fn info(&mut self, message: &str) {
        self.lines.push(message.to_string());
    }

    fn verbose(&mut self, message: &str) {
        if self.collect_verbose {
            self.lines.push(message.to_string());
        }
    }

    fn error(&mut self, message: &str) {
        self.lines.push(format!("ERROR: {message}"));
    }
}

/// TracingTraceWriter forwards to the `tracing` macros.
#[derive(Debug, Default)]
pub struct TracingTraceWriter;

impl TraceWriter for TracingTraceWriter {
    fn info(&mut self, message: &str) {
        tracing::info!("{message}");
    }

    fn verbose(&mut self, message: &str) {
        tracing::debug!("{message}");
    }

    fn error(&mut self, message: &str) {
        tracing::error!("{message}");
    }
}
