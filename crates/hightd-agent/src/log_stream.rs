use bollard::container::LogOutput;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Accumulates raw container output and yields complete lines. The runtime
/// hands us TTY console chunks or demuxed stdout/stderr frames; either way
/// the payload is bytes that may end mid-line, so partial input is buffered
/// until its newline arrives. Lines are split on `\r?\n` and empty lines
/// are dropped.
#[derive(Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).into_owned());
            }
        }
        lines
    }

    /// Drains whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(rest.strip_suffix(b"\r").unwrap_or(&rest)).into_owned();
        if text.is_empty() { None } else { Some(text) }
    }
}

/// A running follow-logs task. Stopping is idempotent; dropping the handle
/// also stops the task.
pub struct LogStream {
    task: JoinHandle<()>,
}

impl LogStream {
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Follow a container output stream, delivering lines in arrival order.
/// A stream error ends the task; the receiver observes the close.
pub fn follow<S>(mut stream: S, lines: mpsc::UnboundedSender<String>) -> LogStream
where
    S: Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send + Unpin + 'static,
{
    let task = tokio::spawn(async move {
        let mut buffer = LineBuffer::new();
        loop {
            match stream.next().await {
                Some(Ok(output)) => {
                    for line in buffer.push(&output.into_bytes()) {
                        if lines.send(line).is_err() {
                            return;
                        }
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(%err, "container log stream failed");
                    break;
                }
                None => break,
            }
        }
        if let Some(rest) = buffer.finish() {
            let _ = lines.send(rest);
        }
    });
    LogStream { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_lf_and_crlf() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"one\r\ntwo\nthree");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(buf.finish(), Some("three".to_string()));
    }

    #[test]
    fn buffers_partial_lines_across_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"hel").is_empty());
        assert_eq!(buf.push(b"lo\nwor"), vec!["hello".to_string()]);
        assert_eq!(buf.push(b"ld\n"), vec!["world".to_string()]);
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn empty_lines_are_dropped() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"a\n\n\r\nb\n");
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn invalid_utf8_is_replaced_not_lost() {
        let mut buf = LineBuffer::new();
        let lines = buf.push(b"ok \xff\xfe end\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok "));
        assert!(lines[0].ends_with(" end"));
    }

    #[tokio::test]
    async fn follow_delivers_lines_in_arrival_order() {
        let chunks: Vec<Result<LogOutput, bollard::errors::Error>> = vec![
            Ok(LogOutput::Console {
                message: b"first\nsec".to_vec().into(),
            }),
            Ok(LogOutput::StdOut {
                message: b"ond\n".to_vec().into(),
            }),
        ];
        let stream = futures_util::stream::iter(chunks);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = follow(stream, tx);
        assert_eq!(rx.recv().await, Some("first".to_string()));
        assert_eq!(rx.recv().await, Some("second".to_string()));
        assert_eq!(rx.recv().await, None);

        // Stopping after completion is a no-op.
        handle.stop();
        handle.stop();
    }
}
