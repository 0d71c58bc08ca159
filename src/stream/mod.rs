pub mod classifier;
pub mod lines;
pub mod retry;
pub mod sentinel;

pub use classifier::{classify_line, LineRecord};
pub use lines::sse_line_stream;
pub use retry::{process_stream_with_retries, InterruptionReason};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::ProxyError;

/// Encode one SSE record: the line followed by the blank-line terminator.
#[must_use]
pub fn encode_sse_record(line: &str) -> Bytes {
    let mut out = String::with_capacity(line.len() + 2);
    out.push_str(line);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Encode an `event: error` frame carrying the given data payload.
#[must_use]
pub fn encode_error_frame(data: &str) -> Bytes {
    let mut out = String::with_capacity(20 + data.len());
    out.push_str("event: error\ndata: ");
    out.push_str(data);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Writer side of a streaming session.
///
/// Frames are pushed into a bounded channel whose receiver backs the client
/// response body; each chunk is flushed to the socket as it is sent. A
/// closed channel means the client went away.
pub struct ClientWriter {
    tx: mpsc::Sender<Bytes>,
}

impl ClientWriter {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }

    /// Forward one SSE line to the client, appending the record terminator.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ClientDisconnected`] when the client has
    /// dropped the response body.
    pub async fn send_line(&self, line: &str) -> Result<(), ProxyError> {
        self.tx
            .send(encode_sse_record(line))
            .await
            .map_err(|_| ProxyError::ClientDisconnected)
    }

    /// Emit an `event: error` frame with the given data payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::ClientDisconnected`] when the client has
    /// dropped the response body.
    pub async fn send_error_frame(&self, data: &str) -> Result<(), ProxyError> {
        self.tx
            .send(encode_error_frame(data))
            .await
            .map_err(|_| ProxyError::ClientDisconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_sse_record() {
        assert_eq!(
            encode_sse_record("data: {\"x\":1}"),
            Bytes::from_static(b"data: {\"x\":1}\n\n")
        );
    }

    #[test]
    fn test_encode_error_frame() {
        assert_eq!(
            encode_error_frame("{\"error\":{}}"),
            Bytes::from_static(b"event: error\ndata: {\"error\":{}}\n\n")
        );
    }

    #[tokio::test]
    async fn test_writer_reports_client_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let writer = ClientWriter::new(tx);
        let err = writer.send_line("data: x").await.expect_err("closed");
        assert!(matches!(err, ProxyError::ClientDisconnected));
    }

    #[tokio::test]
    async fn test_writer_sends_terminated_records() {
        let (tx, mut rx) = mpsc::channel(4);
        let writer = ClientWriter::new(tx);
        writer.send_line("data: hello").await.expect("send");
        assert_eq!(
            rx.recv().await.expect("frame"),
            Bytes::from_static(b"data: hello\n\n")
        );
    }
}
