//! Scalar sink for the command-line trainer.

use bprim_train::report::ReportSink;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Serialize)]
struct ScalarRecord<'a> {
    iteration: u32,
    tag: &'a str,
    value: f32,
}

/// Emits every scalar as a `debug!` event and, when a log file is open,
/// appends it as a JSON line.
#[derive(Debug, Default)]
pub struct TracingReportSink {
    log: Option<BufWriter<File>>,
}

impl TracingReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_log_file(path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            log: Some(BufWriter::new(file)),
        })
    }
}

impl ReportSink for TracingReportSink {
    fn scalar(&mut self, tag: &str, value: f32, iteration: u32) {
        debug!(iteration, tag, value, "scalar");
        let Some(log) = self.log.as_mut() else {
            return;
        };
        let written = serde_json::to_writer(&mut *log, &ScalarRecord { iteration, tag, value })
            .map_err(std::io::Error::from)
            .and_then(|_| log.write_all(b"\n"));
        if let Err(e) = written {
            warn!("Disabling scalar log after write failure: {}", e);
            self.log = None;
        }
    }
}

impl Drop for TracingReportSink {
    fn drop(&mut self) {
        if let Some(log) = self.log.as_mut() {
            log.flush().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalars_written_as_json_lines() {
        let path = std::env::temp_dir().join(format!("bprim-scalars-{}.jsonl", std::process::id()));
        {
            let mut sink = TracingReportSink::with_log_file(&path).unwrap();
            sink.scalar("train_loss_patches/l2_loss", 0.5, 10);
            sink.scalar("total_points", 42.0, 10);
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["tag"], "train_loss_patches/l2_loss");
        assert_eq!(lines[1]["value"], 42.0);
        std::fs::remove_file(&path).ok();
    }
}
