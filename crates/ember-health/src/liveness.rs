//! HTTP liveness probe against the executor's own endpoint.

use std::time::Duration;

use http_body_util::BodyExt;
use tracing::debug;

/// Answer from a single liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    /// 2xx with a well-formed body.
    Alive,
    /// Connection refused, handshake failure, or timeout.
    Unreachable,
    /// 5xx: the engine answers but is still loading.
    Starting(u16),
    /// A terminal answer that will not improve by waiting.
    Malformed(String),
}

/// Probe `GET http://{address}{path}` with a bounded timeout.
///
/// A 2xx response that declares `application/json` must carry a parseable
/// JSON body. 4xx means the path is wrong and is reported as `Malformed`.
pub async fn liveness_probe(address: &str, path: &str, timeout: Duration) -> Liveness {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "liveness connection failed");
                return Liveness::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "liveness handshake failed");
                return Liveness::Unreachable;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "ember-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => return Liveness::Malformed(format!("invalid probe uri {uri}: {e}")),
        };

        let resp = match sender.send_request(req).await {
            Ok(resp) => resp,
            Err(e) if e.is_parse() => {
                return Liveness::Malformed(format!("unparsable response from {uri}: {e}"));
            }
            Err(e) => {
                debug!(error = %e, %uri, "liveness request failed");
                return Liveness::Unreachable;
            }
        };

        let status = resp.status();
        if status.is_server_error() {
            debug!(%status, %uri, "executor still starting");
            return Liveness::Starting(status.as_u16());
        }
        if !status.is_success() {
            return Liveness::Malformed(format!("health endpoint {uri} returned {status}"));
        }

        let is_json = resp
            .headers()
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/json"));

        let body = match resp.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(error = %e, %uri, "liveness body read failed");
                return Liveness::Unreachable;
            }
        };

        if is_json && serde_json::from_slice::<serde_json::Value>(&body).is_err() {
            return Liveness::Malformed(format!("health endpoint {uri} returned invalid json"));
        }

        Liveness::Alive
    })
    .await;

    match result {
        Ok(liveness) => liveness,
        Err(_) => {
            debug!(%uri, "liveness probe timed out");
            Liveness::Unreachable
        }
    }
}
