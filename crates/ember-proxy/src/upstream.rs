//! HTTP/1.1 transport to the executor and NDJSON stream decoding.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use ember_core::{GenerateChunk, PullProgress};

use crate::error::{ProxyError, ProxyResult};

/// Stream of decoded records from one upstream response.
///
/// Records arrive in upstream order. The stream ends after the final
/// record, or with exactly one error if the upstream fails first.
pub struct NdjsonStream<T> {
    rx: mpsc::Receiver<ProxyResult<T>>,
}

// Never pinned structurally; the receiver is only polled by reference.
impl<T> Unpin for NdjsonStream<T> {}

impl<T> Stream for NdjsonStream<T> {
    type Item = ProxyResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

pub type GenerateStream = NdjsonStream<GenerateChunk>;
pub type PullStream = NdjsonStream<PullProgress>;

/// Connection settings for the executor endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Upstream {
    address: String,
    timeout: Duration,
}

impl Upstream {
    pub(crate) fn new(address: &str, timeout: Duration) -> Self {
        Self {
            address: address.to_string(),
            timeout,
        }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Open a connection, send one request and wait for the response head.
    ///
    /// Bounded by the request timeout. Non-2xx answers become
    /// [`ProxyError::Upstream`] carrying the response body.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> ProxyResult<Exchange> {
        let uri = format!("http://{}{}", self.address, path);

        let exchange = tokio::time::timeout(self.timeout, async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| self.connect_error(e))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| self.connect_error(e))?;

            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "executor connection closed");
                }
            });

            let mut builder = Request::builder()
                .method(method)
                .uri(&uri)
                .header(HOST, &self.address)
                .header(USER_AGENT, "ember-proxy/0.1");
            let payload = match body {
                Some(value) => {
                    builder = builder.header(CONTENT_TYPE, "application/json");
                    serde_json::to_vec(&value)
                        .map(Bytes::from)
                        .map_err(|e| ProxyError::Malformed(format!("request body: {e}")))?
                }
                None => Bytes::new(),
            };
            let req = builder
                .body(Full::new(payload))
                .map_err(|e| ProxyError::Malformed(format!("invalid request to {uri}: {e}")))?;

            let response = sender.send_request(req).await.map_err(|e| {
                if e.is_parse() {
                    ProxyError::Malformed(format!("unparsable response from {uri}: {e}"))
                } else {
                    self.connect_error(e)
                }
            })?;

            Ok::<_, ProxyError>(Exchange {
                response,
                sender,
                timeout: self.timeout,
            })
        })
        .await
        .map_err(|_| ProxyError::Timeout(self.timeout))??;

        let status = exchange.response.status();
        if !status.is_success() {
            let body = exchange
                .bytes()
                .await
                .map(|b| String::from_utf8_lossy(&b).trim().to_string())
                .unwrap_or_default();
            debug!(%status, %uri, "executor rejected request");
            return Err(ProxyError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(exchange)
    }

    fn connect_error(&self, err: impl std::fmt::Display) -> ProxyError {
        ProxyError::Connect {
            address: self.address.clone(),
            reason: err.to_string(),
        }
    }
}

/// A response head plus the connection it arrived on.
pub(crate) struct Exchange {
    response: Response<Incoming>,
    sender: SendRequest<Full<Bytes>>,
    timeout: Duration,
}

impl Exchange {
    /// Read the whole body, bounded by the request timeout.
    pub(crate) async fn bytes(self) -> ProxyResult<Bytes> {
        let collected = tokio::time::timeout(self.timeout, self.response.into_body().collect())
            .await
            .map_err(|_| ProxyError::Timeout(self.timeout))?
            .map_err(|e| ProxyError::StreamInterrupted(e.to_string()))?;
        Ok(collected.to_bytes())
    }

    pub(crate) async fn json<T: DeserializeOwned>(self) -> ProxyResult<T> {
        let body = self.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| ProxyError::Malformed(e.to_string()))
    }

    /// Hand the body to a reader task that decodes one record per line.
    ///
    /// `is_final` marks the record that completes the stream. A body that
    /// ends before it, goes silent for longer than `idle`, or breaks off
    /// yields [`ProxyError::StreamInterrupted`] after every record already
    /// received.
    pub(crate) fn into_stream<T>(
        self,
        buffer: usize,
        idle: Duration,
        is_final: fn(&T) -> bool,
    ) -> NdjsonStream<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let Exchange {
            response, sender, ..
        } = self;
        tokio::spawn(pump(response.into_body(), sender, tx, idle, is_final));
        NdjsonStream { rx }
    }
}

async fn pump<T>(
    mut body: Incoming,
    sender: SendRequest<Full<Bytes>>,
    tx: mpsc::Sender<ProxyResult<T>>,
    idle: Duration,
    is_final: fn(&T) -> bool,
) where
    T: DeserializeOwned + Send + 'static,
{
    let mut lines = LineBuffer::<T>::new();

    let outcome: Result<(), ProxyError> = 'read: loop {
        let frame = tokio::select! {
            _ = tx.closed() => {
                debug!("caller dropped stream, closing upstream");
                break 'read Ok(());
            }
            frame = tokio::time::timeout(idle, body.frame()) => frame,
        };

        let data = match frame {
            Err(_) => {
                break 'read Err(ProxyError::StreamInterrupted(format!(
                    "no data from executor for {idle:?}"
                )));
            }
            Ok(None) => match lines.finish() {
                Some(Ok(record)) if is_final(&record) => {
                    let _ = tx.send(Ok(record)).await;
                    break 'read Ok(());
                }
                Some(Ok(record)) => {
                    if tx.send(Ok(record)).await.is_err() {
                        break 'read Ok(());
                    }
                    break 'read Err(ProxyError::StreamInterrupted(
                        "executor closed the stream before completion".into(),
                    ));
                }
                Some(Err(e)) => break 'read Err(e),
                None => {
                    break 'read Err(ProxyError::StreamInterrupted(
                        "executor closed the stream before completion".into(),
                    ));
                }
            },
            Ok(Some(Err(e))) => break 'read Err(ProxyError::StreamInterrupted(e.to_string())),
            Ok(Some(Ok(frame))) => match frame.into_data() {
                Ok(data) => data,
                Err(_) => continue,
            },
        };

        lines.extend(&data);
        while let Some(decoded) = lines.next_record() {
            match decoded {
                Ok(record) => {
                    let last = is_final(&record);
                    if tx.send(Ok(record)).await.is_err() {
                        break 'read Ok(());
                    }
                    if last {
                        break 'read Ok(());
                    }
                }
                Err(e) => break 'read Err(e),
            }
        }
    };

    if let Err(e) = outcome {
        warn!(error = %e, "executor stream ended abnormally");
        let _ = tx.send(Err(e)).await;
    }
    drop(sender);
}

/// Accumulates body bytes and splits them into newline-terminated records.
struct LineBuffer<T> {
    buf: BytesMut,
    _record: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> LineBuffer<T> {
    fn new() -> Self {
        Self {
            buf: BytesMut::new(),
            _record: PhantomData,
        }
    }

    fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete record, skipping blank lines.
    fn next_record(&mut self) -> Option<ProxyResult<T>> {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line = self.buf.split_to(pos + 1);
            if let Some(decoded) = decode_line(&line) {
                return Some(decoded);
            }
        }
        None
    }

    /// Whatever trails the last newline once the body has ended.
    fn finish(&mut self) -> Option<ProxyResult<T>> {
        if let Some(decoded) = self.next_record() {
            return Some(decoded);
        }
        let rest = self.buf.split();
        decode_line(&rest)
    }
}

/// Decode one NDJSON line. Blank lines yield `None`; an `{"error": …}`
/// object is the executor reporting a failure in-band.
fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Option<ProxyResult<T>> {
    let text = match std::str::from_utf8(line) {
        Ok(text) => text.trim(),
        Err(e) => return Some(Err(ProxyError::Malformed(format!("non-utf8 record: {e}")))),
    };
    if text.is_empty() {
        return None;
    }

    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return Some(Err(ProxyError::Malformed(format!("{e}: {text}")))),
    };
    if let Some(msg) = value.get("error").and_then(|e| e.as_str()) {
        return Some(Err(ProxyError::Engine(msg.to_string())));
    }
    Some(serde_json::from_value(value).map_err(|e| ProxyError::Malformed(format!("{e}: {text}"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_records_split_across_frames() {
        let mut lines = LineBuffer::<GenerateChunk>::new();
        lines.extend(b"{\"response\":\"Hel\",\"done\":false}\n{\"respo");
        let first = lines.next_record().unwrap().unwrap();
        assert_eq!(first.chunk, "Hel");
        assert!(lines.next_record().is_none());

        lines.extend(b"nse\":\"lo\",\"done\":false}\n\n{\"response\":\"\",\"done\":true}");
        assert_eq!(lines.next_record().unwrap().unwrap().chunk, "lo");
        assert!(lines.next_record().is_none());

        let last = lines.finish().unwrap().unwrap();
        assert!(last.done);
        assert!(lines.finish().is_none());
    }

    #[test]
    fn in_band_error_is_engine_error() {
        let decoded = decode_line::<PullProgress>(b"{\"error\":\"pull model manifest: file does not exist\"}\n");
        assert!(matches!(decoded, Some(Err(ProxyError::Engine(msg))) if msg.contains("manifest")));
    }

    #[test]
    fn garbage_line_is_malformed() {
        let decoded = decode_line::<GenerateChunk>(b"<html>\n");
        assert!(matches!(decoded, Some(Err(ProxyError::Malformed(_)))));
        assert!(decode_line::<GenerateChunk>(b"   \r\n").is_none());
    }

    #[test]
    fn pull_progress_uses_engine_field_names() {
        let progress = decode_line::<PullProgress>(
            b"{\"status\":\"downloading\",\"completed\":512,\"total\":2048}",
        )
        .unwrap()
        .unwrap();
        assert_eq!(progress.bytes_downloaded, 512);
        assert_eq!(progress.total_bytes, 2048);
        assert!(!progress.is_final());
    }
}
