//! Serialized output sink.
//!
//! Many workers stream test output concurrently; writing it straight to
//! stdout would interleave mid-line and corrupt the human-readable stream.
//! The sink is a single-consumer actor: producers send lines over a
//! channel, one task writes them in arrival order.
//!
//! Output attributed to a slot prints a timestamped banner whenever the
//! attributed slot changes, so a reader can follow which device the
//! subsequent block of output belongs to. Unattributed lines pass through
//! without affecting the banner state.

use std::io::Write;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

enum SinkMessage {
    Line { slot: Option<String>, text: String },
}

/// Cheap cloneable handle for appending to the sink.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl SinkHandle {
    /// Appends a line of text, optionally attributed to a slot.
    ///
    /// Appending never blocks; if the sink has already shut down the line
    /// is dropped.
    pub fn line(&self, slot: Option<&str>, text: impl Into<String>) {
        let _ = self.tx.send(SinkMessage::Line {
            slot: slot.map(|s| s.to_string()),
            text: text.into(),
        });
    }

    /// Creates a handle whose output goes nowhere.
    #[cfg(test)]
    pub fn discard() -> SinkHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SinkHandle { tx }
    }
}

/// The ordered output sink.
///
/// Owns the consumer task; [`close`](Self::close) drains everything queued
/// before returning, which is what guarantees the final summary appears
/// after all worker output.
pub struct OutputSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
    task: JoinHandle<()>,
}

impl OutputSink {
    /// Creates a sink writing to stdout.
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(std::io::stdout()))
    }

    /// Creates a sink writing to an arbitrary writer.
    pub fn with_writer(mut writer: Box<dyn Write + Send>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut last_slot: Option<String> = None;
            while let Some(SinkMessage::Line { slot, text }) = rx.recv().await {
                if let Some(name) = &slot
                    && last_slot.as_deref() != Some(name.as_str())
                {
                    let stamp = chrono::Local::now().format("%-m/%-d/%y %-I:%M:%S %p");
                    let _ = writeln!(writer, "\n{} ----------- {} -----------", stamp, name);
                    last_slot = slot.clone();
                }
                if writeln!(writer, "{}", text).is_err() {
                    warn!("Output sink writer failed; dropping further output");
                    break;
                }
                // Flush per line so progress is visible while runs stall.
                let _ = writer.flush();
            }
        });

        Self { tx, task }
    }

    /// Returns a handle for producers.
    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
        }
    }

    /// Shuts the sink down after draining all queued output.
    pub async fn close(self) {
        drop(self.tx);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    #[tokio::test]
    async fn writes_lines_in_order() {
        let buf = SharedBuf::default();
        let sink = OutputSink::with_writer(Box::new(buf.clone()));
        let handle = sink.handle();

        handle.line(None, "first");
        handle.line(None, "second");
        handle.line(None, "third");
        drop(handle);
        sink.close().await;

        let out = buf.contents();
        let first = out.find("first").unwrap();
        let second = out.find("second").unwrap();
        let third = out.find("third").unwrap();
        assert!(first < second && second < third);
    }

    #[tokio::test]
    async fn banner_printed_when_slot_changes() {
        let buf = SharedBuf::default();
        let sink = OutputSink::with_writer(Box::new(buf.clone()));
        let handle = sink.handle();

        handle.line(Some("iPhone 6 1"), "alpha");
        handle.line(Some("iPhone 6 1"), "beta");
        handle.line(Some("iPhone 6 2"), "gamma");
        drop(handle);
        sink.close().await;

        let out = buf.contents();
        assert_eq!(out.matches("----------- iPhone 6 1 -----------").count(), 1);
        assert_eq!(out.matches("----------- iPhone 6 2 -----------").count(), 1);
    }

    #[tokio::test]
    async fn unattributed_lines_do_not_reset_banner() {
        let buf = SharedBuf::default();
        let sink = OutputSink::with_writer(Box::new(buf.clone()));
        let handle = sink.handle();

        handle.line(Some("iPhone 6 1"), "alpha");
        handle.line(None, "narrative");
        handle.line(Some("iPhone 6 1"), "beta");
        drop(handle);
        sink.close().await;

        let out = buf.contents();
        assert_eq!(out.matches("----------- iPhone 6 1 -----------").count(), 1);
    }

    #[tokio::test]
    async fn close_drains_queued_output() {
        let buf = SharedBuf::default();
        let sink = OutputSink::with_writer(Box::new(buf.clone()));
        let handle = sink.handle();

        for i in 0..100 {
            handle.line(None, format!("line {}", i));
        }
        drop(handle);
        sink.close().await;

        assert!(buf.contents().contains("line 99"));
    }
}
