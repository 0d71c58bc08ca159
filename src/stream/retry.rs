use std::fmt;
use std::pin::Pin;
use std::time::Instant;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Map, Value};

use crate::config::RetryConfig;
use crate::error::ProxyError;
use crate::observability::ProxyMetrics;
use crate::prompt::build_continuation_body;
use crate::prompt::DONE_SENTINEL;
use crate::stream::classifier::classify_line;
use crate::stream::lines::sse_line_stream;
use crate::stream::sentinel::remove_done_token_from_line;
use crate::stream::ClientWriter;
use crate::transport::HttpTransport;

/// Why a stream attempt was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionReason {
    /// The upstream ended (or errored) without a finish reason.
    Drop,
    /// A block-reason indicator surfaced in the stream.
    Block,
    /// The model signalled completion while still in a thought chunk.
    FinishDuringThought,
    /// STOP arrived but the accumulated text does not end with the sentinel.
    FinishIncomplete,
    /// STOP arrived with no accumulated text at all.
    FinishEmptyResponse,
    /// A finish reason outside {STOP, MAX_TOKENS}.
    FinishAbnormal,
}

impl InterruptionReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            InterruptionReason::Drop => "DROP",
            InterruptionReason::Block => "BLOCK",
            InterruptionReason::FinishDuringThought => "FINISH_DURING_THOUGHT",
            InterruptionReason::FinishIncomplete => "FINISH_INCOMPLETE",
            InterruptionReason::FinishEmptyResponse => "FINISH_EMPTY_RESPONSE",
            InterruptionReason::FinishAbnormal => "FINISH_ABNORMAL",
        }
    }
}

impl fmt::Display for InterruptionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream statuses that cannot be retried once a session is mid-stream: a
/// rate-limited or rejected continuation cannot be safely spliced.
const NON_RETRYABLE_RETRY_STATUSES: [u16; 5] = [400, 401, 403, 404, 429];

type LineStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Outcome of consuming one upstream stream to its end.
#[derive(Debug)]
enum StreamPass {
    CleanExit,
    Interrupted(InterruptionReason),
}

/// Drive a streaming session to completion, transparently retrying
/// mid-stream interruptions.
///
/// Consumes the initial 200-OK upstream response and forwards its SSE lines
/// to the client; on interruption, issues continuation requests built from
/// the accumulated text until the stream terminates cleanly, the retry
/// budget is exhausted, or a non-retryable status surfaces during a retry.
///
/// # Errors
///
/// - [`ProxyError::ClientDisconnected`] when a client write fails; the
///   current upstream body is dropped and no further requests are issued.
/// - [`ProxyError::RetryLimitExceeded`] after the error frame was emitted.
/// - [`ProxyError::FatalRetryStatus`] when a continuation request returns a
///   non-retryable status; the upstream body is relayed as an error frame.
#[allow(clippy::too_many_arguments)]
pub async fn process_stream_with_retries(
    retry: &RetryConfig,
    transport: &HttpTransport,
    metrics: &ProxyMetrics,
    writer: &ClientWriter,
    initial_response: reqwest::Response,
    original_body: &Map<String, Value>,
    upstream_url: &str,
    upstream_headers: &http::HeaderMap,
) -> Result<(), ProxyError> {
    let mut session = Session::default();
    let mut current: Option<LineStream> =
        Some(Box::pin(sse_line_stream(initial_response.bytes_stream())));
    let session_start = Instant::now();

    tracing::info!(
        max_retries = retry.max_consecutive_retries,
        "starting stream processing session"
    );

    loop {
        let stream_start = Instant::now();
        tracing::debug!(
            attempt = session.consecutive_retry_count + 1,
            "starting stream attempt"
        );

        let pass = match current.as_mut() {
            Some(stream) => session.consume_stream(stream, writer).await?,
            None => StreamPass::Interrupted(InterruptionReason::Drop),
        };
        // Close the exhausted upstream before anything else happens.
        current = None;

        tracing::debug!(
            duration_ms = stream_start.elapsed().as_millis() as u64,
            total_lines = session.total_lines_processed,
            accumulated_chars = session.accumulated_text.len(),
            "stream attempt finished"
        );

        let reason = match pass {
            StreamPass::CleanExit => {
                metrics.record_accumulated_text_bytes(session.accumulated_text.len() as u64);
                tracing::info!(
                    duration_ms = session_start.elapsed().as_millis() as u64,
                    total_lines = session.total_lines_processed,
                    total_chars = session.accumulated_text.len(),
                    retries = session.consecutive_retry_count,
                    "stream completed successfully"
                );
                return Ok(());
            }
            StreamPass::Interrupted(reason) => reason,
        };

        metrics.record_interruption(reason.as_str());
        tracing::warn!(
            reason = reason.as_str(),
            retry_count = session.consecutive_retry_count,
            accumulated_chars = session.accumulated_text.len(),
            "stream interrupted"
        );

        if retry.swallow_thoughts_after_retry && session.is_outputting_formal_text {
            tracing::info!(
                "retry triggered after formal text output; will swallow thought chunks until formal text resumes"
            );
            session.swallow_mode_active = true;
        }

        if session.consecutive_retry_count >= retry.max_consecutive_retries {
            metrics.record_accumulated_text_bytes(session.accumulated_text.len() as u64);
            let payload = retry_limit_payload(retry.max_consecutive_retries, reason, &session);
            let _ = writer.send_error_frame(&payload.to_string()).await;
            return Err(ProxyError::RetryLimitExceeded(
                retry.max_consecutive_retries,
            ));
        }

        session.consecutive_retry_count += 1;
        metrics.record_retry();
        tracing::info!(
            retry = session.consecutive_retry_count,
            max_retries = retry.max_consecutive_retries,
            "starting retry"
        );

        current = Some(
            session
                .open_continuation_stream(retry, transport, writer, original_body, upstream_url, upstream_headers)
                .await?,
        );
    }
}

/// Per-session state; owned exclusively by the session task.
#[derive(Default)]
struct Session {
    accumulated_text: String,
    consecutive_retry_count: u32,
    is_outputting_formal_text: bool,
    swallow_mode_active: bool,
    total_lines_processed: u64,
}

impl Session {
    /// Consume one upstream stream, forwarding lines to the client until it
    /// terminates or an interruption is detected.
    async fn consume_stream(
        &mut self,
        stream: &mut LineStream,
        writer: &ClientWriter,
    ) -> Result<StreamPass, ProxyError> {
        while let Some(line) = stream.next().await {
            self.total_lines_processed += 1;
            let record = classify_line(&line);

            if self.swallow_mode_active {
                if record.is_thought {
                    tracing::debug!("swallowing thought chunk due to post-retry filter");
                    if record.has_finish_reason() {
                        tracing::warn!(
                            finish_reason = %record.finish_reason,
                            "stream stopped while swallowing a thought chunk"
                        );
                        return Ok(StreamPass::Interrupted(
                            InterruptionReason::FinishDuringThought,
                        ));
                    }
                    continue;
                }
                tracing::info!("first formal text chunk after swallowing; resuming normal stream");
                self.swallow_mode_active = false;
            }

            if record.has_finish_reason() && record.is_thought {
                tracing::warn!(
                    finish_reason = %record.finish_reason,
                    "stream stopped on a thought chunk; invalid state"
                );
                return Ok(StreamPass::Interrupted(
                    InterruptionReason::FinishDuringThought,
                ));
            }

            if record.is_blocked {
                tracing::warn!("content block detected in stream");
                return Ok(StreamPass::Interrupted(InterruptionReason::Block));
            }

            if record.finish_reason == "STOP" {
                let combined = format!("{}{}", self.accumulated_text, record.text);
                let trimmed = combined.trim();
                if trimmed.is_empty() {
                    tracing::warn!("finish reason STOP with no text content; empty response");
                    return Ok(StreamPass::Interrupted(
                        InterruptionReason::FinishEmptyResponse,
                    ));
                }
                if !trimmed.ends_with(DONE_SENTINEL) {
                    tracing::warn!("finish reason STOP without sentinel; treating as incomplete");
                    return Ok(StreamPass::Interrupted(InterruptionReason::FinishIncomplete));
                }
            } else if record.has_finish_reason() && record.finish_reason != "MAX_TOKENS" {
                tracing::warn!(
                    finish_reason = %record.finish_reason,
                    "abnormal finish reason"
                );
                return Ok(StreamPass::Interrupted(InterruptionReason::FinishAbnormal));
            }

            let is_terminal = record.is_terminal();
            let processed = remove_done_token_from_line(&line, is_terminal);
            writer.send_line(processed.as_ref()).await?;

            if !record.text.is_empty() && !record.is_thought {
                self.is_outputting_formal_text = true;
                self.accumulated_text.push_str(&record.text);
            }

            if is_terminal {
                tracing::info!(
                    finish_reason = %record.finish_reason,
                    "finish reason accepted as final; stream complete"
                );
                return Ok(StreamPass::CleanExit);
            }
        }

        tracing::warn!("stream ended without finish reason; detected as drop");
        Ok(StreamPass::Interrupted(InterruptionReason::Drop))
    }

    /// Issue continuation requests until one yields a 200 stream.
    ///
    /// Transport failures and retryable non-200 statuses sleep `retry_delay`
    /// and reissue without touching the retry counter; a non-retryable
    /// status relays the upstream body as an error frame and fails the
    /// session.
    async fn open_continuation_stream(
        &self,
        retry: &RetryConfig,
        transport: &HttpTransport,
        writer: &ClientWriter,
        original_body: &Map<String, Value>,
        upstream_url: &str,
        upstream_headers: &http::HeaderMap,
    ) -> Result<LineStream, ProxyError> {
        let retry_body = build_continuation_body(original_body, &self.accumulated_text);
        let body_bytes = serde_json::to_vec(&Value::Object(retry_body))
            .map_err(|e| ProxyError::Internal(format!("Failed to serialize retry body: {e}")))?;
        let body_bytes = bytes::Bytes::from(body_bytes);

        loop {
            tracing::debug!(
                url = upstream_url,
                body_bytes = body_bytes.len(),
                "issuing continuation request"
            );
            let response = match transport
                .send_stream(
                    upstream_url,
                    http::Method::POST,
                    upstream_headers,
                    body_bytes.clone(),
                )
                .await
            {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        retry = self.consecutive_retry_count,
                        error = %err,
                        delay_ms = retry.retry_delay_ms,
                        "continuation request failed; will reissue"
                    );
                    tokio::time::sleep(retry.retry_delay()).await;
                    continue;
                }
            };

            let status = response.status();
            tracing::info!(status = status.as_u16(), "continuation request completed");

            if NON_RETRYABLE_RETRY_STATUSES.contains(&status.as_u16()) {
                tracing::error!(
                    status = status.as_u16(),
                    retry = self.consecutive_retry_count,
                    "non-retryable status during retry"
                );
                let body = response.bytes().await.unwrap_or_default();
                let _ = writer
                    .send_error_frame(&String::from_utf8_lossy(&body))
                    .await;
                return Err(ProxyError::FatalRetryStatus(status.as_u16()));
            }

            if status != http::StatusCode::OK {
                tracing::warn!(
                    status = status.as_u16(),
                    retry = self.consecutive_retry_count,
                    delay_ms = retry.retry_delay_ms,
                    "retryable status on continuation attempt"
                );
                drop(response);
                tokio::time::sleep(retry.retry_delay()).await;
                continue;
            }

            tracing::info!(
                retry = self.consecutive_retry_count,
                accumulated_chars = self.accumulated_text.len(),
                "continuation stream established"
            );
            return Ok(Box::pin(sse_line_stream(response.bytes_stream())));
        }
    }
}

fn retry_limit_payload(
    max_retries: u32,
    reason: InterruptionReason,
    session: &Session,
) -> Value {
    json!({
        "error": {
            "code": 504,
            "status": "DEADLINE_EXCEEDED",
            "message": format!(
                "Retry limit ({max_retries}) exceeded after stream interruption. Last reason: {reason}."
            ),
            "details": [{
                "@type": "proxy.debug",
                "accumulated_text_chars": session.accumulated_text.len(),
            }],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    fn line_stream_from(frames: &[&str]) -> LineStream {
        let chunks: Vec<Result<Bytes, std::convert::Infallible>> = frames
            .iter()
            .map(|frame| Ok(Bytes::from(format!("{frame}\n\n"))))
            .collect();
        Box::pin(sse_line_stream(futures_util::stream::iter(chunks)))
    }

    fn collect_frames(rx: &mut mpsc::Receiver<Bytes>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            frames.push(String::from_utf8(chunk.to_vec()).expect("utf8"));
        }
        frames
    }

    #[tokio::test]
    async fn test_clean_stop_with_sentinel() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Hello [done]"}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(pass, StreamPass::CleanExit));

        let frames = collect_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""text":"Hello ""#));
        assert!(frames[0].ends_with("\n\n"));
        assert_eq!(session.accumulated_text, "Hello [done]");
    }

    #[tokio::test]
    async fn test_drop_without_finish_reason() {
        let (tx, _rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"Part A."}]}}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::Drop)
        ));
        assert_eq!(session.accumulated_text, "Part A.");
        assert!(session.is_outputting_formal_text);
    }

    #[tokio::test]
    async fn test_finish_during_thought() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"hmm","thought":true}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::FinishDuringThought)
        ));
        assert!(collect_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_block_marker_interrupts() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"promptFeedback":{"blockReason":"SAFETY"}}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::Block)
        ));
        assert!(collect_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_stop_with_empty_accumulated_text() {
        let (tx, _rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream =
            line_stream_from(&[r#"data: {"candidates":[{"finishReason":"STOP"}]}"#]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::FinishEmptyResponse)
        ));
    }

    #[tokio::test]
    async fn test_stop_without_sentinel_is_incomplete() {
        let (tx, _rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"truncated answ"}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::FinishIncomplete)
        ));
    }

    #[tokio::test]
    async fn test_sentinel_split_across_chunks_passes_validation() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"answer [do"}]}}]}"#,
            r#"data: {"candidates":[{"content":{"parts":[{"text":"ne]"}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(pass, StreamPass::CleanExit));

        let frames = collect_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].contains(r#""text":"answer [do""#));
        assert!(frames[1].contains(r#""text":"""#));
    }

    #[tokio::test]
    async fn test_max_tokens_closes_cleanly_without_sentinel() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"cut short"}]},"finishReason":"MAX_TOKENS"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(pass, StreamPass::CleanExit));
        assert_eq!(collect_frames(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn test_abnormal_finish_reason() {
        let (tx, _rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"x"}]},"finishReason":"RECITATION"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::FinishAbnormal)
        ));
    }

    #[tokio::test]
    async fn test_swallow_mode_discards_thoughts_until_formal_text() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session {
            accumulated_text: "before. ".to_string(),
            is_outputting_formal_text: true,
            swallow_mode_active: true,
            ..Session::default()
        };
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"thinking...","thought":true}]}}]}"#,
            r#"data: {"candidates":[{"content":{"parts":[{"text":"more thinking","thought":true}]}}]}"#,
            r#"data: {"candidates":[{"content":{"parts":[{"text":"continuation[done]"}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(pass, StreamPass::CleanExit));
        assert!(!session.swallow_mode_active);

        let frames = collect_frames(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].contains(r#""text":"continuation""#));
        assert!(!frames[0].contains("[done]"));
    }

    #[tokio::test]
    async fn test_swallow_mode_finish_during_thought() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session {
            is_outputting_formal_text: true,
            swallow_mode_active: true,
            ..Session::default()
        };
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"t","thought":true}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(
            pass,
            StreamPass::Interrupted(InterruptionReason::FinishDuringThought)
        ));
        assert!(collect_frames(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_non_data_lines_are_forwarded_verbatim() {
        let (tx, mut rx) = mpsc::channel(16);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            ": keepalive",
            r#"data: {"candidates":[{"content":{"parts":[{"text":"x[done]"}]},"finishReason":"STOP"}]}"#,
        ]);

        let pass = session.consume_stream(&mut stream, &writer).await.expect("pass");
        assert!(matches!(pass, StreamPass::CleanExit));

        let frames = collect_frames(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], ": keepalive\n\n");
    }

    #[tokio::test]
    async fn test_client_disconnect_aborts_session() {
        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let writer = ClientWriter::new(tx);
        let mut session = Session::default();
        let mut stream = line_stream_from(&[
            r#"data: {"candidates":[{"content":{"parts":[{"text":"x"}]}}]}"#,
        ]);

        let err = session
            .consume_stream(&mut stream, &writer)
            .await
            .expect_err("disconnect");
        assert!(matches!(err, ProxyError::ClientDisconnected));
    }

    #[test]
    fn test_retry_limit_payload_shape() {
        let session = Session {
            accumulated_text: "partial".to_string(),
            ..Session::default()
        };
        let payload = retry_limit_payload(3, InterruptionReason::Drop, &session);
        assert_eq!(payload["error"]["code"], 504);
        assert_eq!(payload["error"]["status"], "DEADLINE_EXCEEDED");
        assert_eq!(
            payload["error"]["message"],
            "Retry limit (3) exceeded after stream interruption. Last reason: DROP."
        );
        assert_eq!(payload["error"]["details"][0]["@type"], "proxy.debug");
        assert_eq!(payload["error"]["details"][0]["accumulated_text_chars"], 7);
    }

    #[test]
    fn test_interruption_reason_labels() {
        assert_eq!(InterruptionReason::Drop.as_str(), "DROP");
        assert_eq!(InterruptionReason::Block.as_str(), "BLOCK");
        assert_eq!(
            InterruptionReason::FinishDuringThought.as_str(),
            "FINISH_DURING_THOUGHT"
        );
        assert_eq!(
            InterruptionReason::FinishIncomplete.as_str(),
            "FINISH_INCOMPLETE"
        );
        assert_eq!(
            InterruptionReason::FinishEmptyResponse.as_str(),
            "FINISH_EMPTY_RESPONSE"
        );
        assert_eq!(
            InterruptionReason::FinishAbnormal.as_str(),
            "FINISH_ABNORMAL"
        );
    }
}
