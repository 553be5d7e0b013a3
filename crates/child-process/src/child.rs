//! Child side of an invocation.
//!
//! [`run_and_listen`] reads the single request frame from stdin, runs the local
//! handler with a cancellation token wired to the parent's cancellation frame,
//! writes exactly one response frame to stdout and returns the exit code the
//! process should terminate with. Heartbeat frames are written on a fixed interval
//! for the whole run. All frames are flushed before this function returns.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ChildProcessError, Result};
use crate::failure::{FailureDescriptor, exit_code};
use crate::wire::{ChildFrame, ChildProcessOutput, ParentFrame, decode_frame, encode_frame};

/// Argument carrying the endpoint (correlation id) of the invocation.
pub const ENDPOINT_ARG: &str = "--ipc-endpoint";

/// Argument carrying the heartbeat interval in milliseconds.
pub const HEARTBEAT_ARG: &str = "--heartbeat-ms";

/// Endpoint arguments the parent passes to a child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildArgs {
    pub endpoint: String,
    pub heartbeat_interval: Duration,
}

impl ChildArgs {
    pub fn new(endpoint: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            heartbeat_interval,
        }
    }

    /// Extract the endpoint arguments, ignoring anything else.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut endpoint = None;
        let mut heartbeat_ms = None;
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_ref() {
                ENDPOINT_ARG => endpoint = args.next().map(|v| v.as_ref().to_string()),
                HEARTBEAT_ARG => {
                    let value = args.next().ok_or_else(|| {
                        ChildProcessError::protocol(format!("{HEARTBEAT_ARG} requires a value"))
                    })?;
                    let ms = value.as_ref().parse::<u64>().map_err(|e| {
                        ChildProcessError::protocol(format!("invalid {HEARTBEAT_ARG}: {e}"))
                    })?;
                    heartbeat_ms = Some(ms);
                }
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| {
            ChildProcessError::protocol(format!("missing {ENDPOINT_ARG} argument"))
        })?;
        let heartbeat_ms = heartbeat_ms.filter(|ms| *ms > 0).ok_or_else(|| {
            ChildProcessError::protocol(format!("missing or zero {HEARTBEAT_ARG} argument"))
        })?;

        Ok(Self::new(endpoint, Duration::from_millis(heartbeat_ms)))
    }

    pub fn to_args(&self) -> Vec<String> {
        vec![
            ENDPOINT_ARG.to_string(),
            self.endpoint.clone(),
            HEARTBEAT_ARG.to_string(),
            self.heartbeat_interval.as_millis().to_string(),
        ]
    }
}

/// How a local handler ends without a payload.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler observed cancellation; no response is written.
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] FailureDescriptor),
}

/// Serve one invocation over this process's stdin/stdout.
pub async fn run_and_listen<TIn, TOut, F, Fut>(args: &ChildArgs, handler: F) -> i32
where
    TIn: DeserializeOwned,
    TOut: Serialize,
    F: FnOnce(TIn, CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<TOut, HandlerError>>,
{
    serve(tokio::io::stdin(), tokio::io::stdout(), args, handler).await
}

/// Serve one invocation over an arbitrary reader/writer pair.
pub async fn serve<R, W, TIn, TOut, F, Fut>(
    reader: R,
    writer: W,
    args: &ChildArgs,
    handler: F,
) -> i32
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    TIn: DeserializeOwned,
    TOut: Serialize,
    F: FnOnce(TIn, CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<TOut, HandlerError>>,
{
    let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
    let writer_task = tokio::spawn(write_frames(writer, frame_rx));

    // The first heartbeat is queued before anything else so the parent sees the
    // child alive even if the handler never yields.
    queue_frame(&frame_tx, &ChildFrame::<Value>::Heartbeat { seq: 0 });
    let heartbeat_stop = CancellationToken::new();
    let heartbeat_task = tokio::spawn(send_heartbeats(
        frame_tx.clone(),
        args.heartbeat_interval,
        heartbeat_stop.clone(),
    ));

    let mut lines = BufReader::new(reader).lines();
    let code = match read_request(&mut lines, &args.endpoint).await {
        Err(msg) => {
            error!(endpoint = %args.endpoint, "Invalid request: {}", msg);
            exit_code::PROTOCOL_ERROR
        }
        Ok(payload) => match serde_json::from_value::<TIn>(payload) {
            Err(e) => {
                let failure = FailureDescriptor::generic(format!("invalid request payload: {e}"));
                send_response::<TOut>(&frame_tx, &args.endpoint, Err(failure.clone()));
                failure.exit_code()
            }
            Ok(input) => {
                let cancel = CancellationToken::new();
                let listener = tokio::spawn(listen_for_cancel(lines, cancel.clone()));

                let token = cancel.clone();
                let result = AssertUnwindSafe(async move { handler(input, token).await })
                    .catch_unwind()
                    .await;
                listener.abort();

                match result {
                    Ok(Ok(payload)) => {
                        send_response(&frame_tx, &args.endpoint, Ok(payload))
                    }
                    Ok(Err(HandlerError::Cancelled)) => {
                        info!(endpoint = %args.endpoint, "Handler stopped after cancellation");
                        exit_code::CANCELLED
                    }
                    Ok(Err(HandlerError::Failed(failure))) => {
                        let code = failure.exit_code();
                        send_response::<TOut>(&frame_tx, &args.endpoint, Err(failure));
                        code
                    }
                    Err(panic) => {
                        let failure = FailureDescriptor::generic(panic_message(panic.as_ref()));
                        error!(endpoint = %args.endpoint, "Handler panicked: {}", failure.message);
                        let code = failure.exit_code();
                        send_response::<TOut>(&frame_tx, &args.endpoint, Err(failure));
                        code
                    }
                }
            }
        },
    };

    heartbeat_stop.cancel();
    let _ = heartbeat_task.await;
    drop(frame_tx);
    if let Err(e) = writer_task.await {
        warn!(error = %e, "Frame writer task failed");
    }

    code
}

/// Read lines until the request frame arrives and return its raw payload.
async fn read_request<R>(
    lines: &mut Lines<BufReader<R>>,
    endpoint: &str,
) -> std::result::Result<Value, String>
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return Err("channel closed before the request arrived".to_string()),
            Err(e) => return Err(format!("failed to read request: {e}")),
        };

        match decode_frame::<ParentFrame<Value>>(&line) {
            None => continue,
            Some(Err(e)) => return Err(format!("malformed request frame: {e}")),
            Some(Ok(ParentFrame::Cancel)) => {
                return Err("cancelled before the request arrived".to_string());
            }
            Some(Ok(ParentFrame::Request(input))) => {
                if input.correlation_id != endpoint {
                    return Err(format!(
                        "request correlation id '{}' does not match endpoint '{}'",
                        input.correlation_id, endpoint
                    ));
                }
                return Ok(input.payload);
            }
        }
    }
}

/// Cancel when the parent sends the cancellation frame or closes the channel.
async fn listen_for_cancel<R>(mut lines: Lines<BufReader<R>>, cancel: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(Ok(ParentFrame::<Value>::Cancel)) = decode_frame(&line) {
                    info!("Cancellation requested by parent");
                    cancel.cancel();
                }
            }
            Ok(None) => {
                warn!("Parent closed the channel, cancelling");
                cancel.cancel();
                break;
            }
            Err(e) => {
                warn!(error = %e, "Channel read failed, cancelling");
                cancel.cancel();
                break;
            }
        }
    }
}

async fn send_heartbeats(
    tx: mpsc::UnboundedSender<String>,
    interval: Duration,
    stop: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Consume the immediate first tick; seq 0 was queued synchronously.
    ticker.tick().await;

    let mut seq = 1u64;
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if !queue_frame(&tx, &ChildFrame::<Value>::Heartbeat { seq }) {
                    break;
                }
                seq += 1;
            }
        }
    }
}

async fn write_frames<W>(writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    while let Some(line) = rx.recv().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!(error = %e, "Failed to write frame");
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!(error = %e, "Failed to flush frame");
            return;
        }
    }
    if let Err(e) = writer.flush().await {
        debug!(error = %e, "Final flush failed");
    }
}

fn queue_frame<F: Serialize>(tx: &mpsc::UnboundedSender<String>, frame: &F) -> bool {
    match encode_frame(frame) {
        Ok(line) => tx.send(line).is_ok(),
        Err(e) => {
            error!(error = %e, "Failed to encode frame");
            false
        }
    }
}

/// Queue the response frame and return the matching exit code.
fn send_response<T: Serialize>(
    tx: &mpsc::UnboundedSender<String>,
    endpoint: &str,
    result: std::result::Result<T, FailureDescriptor>,
) -> i32 {
    let code = match &result {
        Ok(_) => exit_code::SUCCESS,
        Err(failure) => failure.exit_code(),
    };
    let frame = ChildFrame::Response {
        correlation_id: endpoint.to_string(),
        outcome: ChildProcessOutput::from(result),
    };

    match encode_frame(&frame) {
        Ok(line) => {
            let _ = tx.send(line);
            code
        }
        Err(e) => {
            let failure = FailureDescriptor::generic(format!("failed to serialize result: {e}"));
            let fallback: ChildFrame<Value> = ChildFrame::Response {
                correlation_id: endpoint.to_string(),
                outcome: ChildProcessOutput::Failure {
                    failure: failure.clone(),
                },
            };
            queue_frame(tx, &fallback);
            failure.exit_code()
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "handler panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, duplex};

    fn args() -> ChildArgs {
        ChildArgs::new("corr-1", Duration::from_millis(50))
    }

    async fn request_line(payload: Value) -> String {
        encode_frame(&ParentFrame::Request(crate::wire::ChildProcessInput {
            correlation_id: "corr-1".to_string(),
            payload,
        }))
        .unwrap()
    }

    /// Collect every frame the child wrote.
    async fn frames(reader: tokio::io::DuplexStream) -> Vec<ChildFrame<Value>> {
        let mut lines = BufReader::new(reader).lines();
        let mut out = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(Ok(frame)) = decode_frame(&line) {
                out.push(frame);
            }
        }
        out
    }

    fn response(frames: &[ChildFrame<Value>]) -> Option<&ChildProcessOutput<Value>> {
        frames.iter().find_map(|frame| match frame {
            ChildFrame::Response { outcome, .. } => Some(outcome),
            _ => None,
        })
    }

    #[test]
    fn test_parse_args() {
        let parsed = ChildArgs::parse(["child", "--ipc-endpoint", "abc", "--heartbeat-ms", "1500"]).unwrap();
        assert_eq!(parsed, ChildArgs::new("abc", Duration::from_millis(1500)));
        assert_eq!(
            ChildArgs::parse(parsed.to_args()).unwrap(),
            parsed
        );
    }

    #[test]
    fn test_parse_args_requires_endpoint() {
        assert!(ChildArgs::parse(["--heartbeat-ms", "10"]).is_err());
        assert!(ChildArgs::parse(["--ipc-endpoint", "x", "--heartbeat-ms", "zero"]).is_err());
        assert!(ChildArgs::parse(["--ipc-endpoint", "x", "--heartbeat-ms", "0"]).is_err());
    }

    #[tokio::test]
    async fn test_success_round_trip() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);

        parent_in
            .write_all(request_line(json!({"IntValue": 2347})).await.as_bytes())
            .await
            .unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |input: Value, _cancel| async move {
            Ok::<_, HandlerError>(input)
        })
        .await;

        assert_eq!(code, exit_code::SUCCESS);
        let frames = collector.await.unwrap();
        assert!(matches!(frames[0], ChildFrame::Heartbeat { seq: 0 }));
        assert_eq!(
            response(&frames),
            Some(&ChildProcessOutput::Success {
                payload: json!({"IntValue": 2347})
            })
        );
        drop(parent_in);
    }

    #[tokio::test]
    async fn test_failure_sets_exit_code() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);
        parent_in
            .write_all(request_line(json!(null)).await.as_bytes())
            .await
            .unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |_: Value, _cancel| async move {
            Err::<Value, _>(HandlerError::Failed(FailureDescriptor::not_found("no such detector")))
        })
        .await;

        assert_eq!(code, 10);
        let frames = collector.await.unwrap();
        match response(&frames) {
            Some(ChildProcessOutput::Failure { failure }) => {
                assert_eq!(failure.message, "no such detector")
            }
            other => panic!("unexpected response: {other:?}"),
        }
        drop(parent_in);
    }

    #[tokio::test]
    async fn test_panic_becomes_generic_failure() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);
        parent_in
            .write_all(request_line(json!(1)).await.as_bytes())
            .await
            .unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |_: Value, _cancel| async move {
            if true {
                panic!("detector exploded");
            }
            Ok::<Value, HandlerError>(Value::Null)
        })
        .await;

        assert_eq!(code, 14);
        let frames = collector.await.unwrap();
        match response(&frames) {
            Some(ChildProcessOutput::Failure { failure }) => {
                assert_eq!(failure.message, "detector exploded");
                assert!(!failure.is_retriable);
            }
            other => panic!("unexpected response: {other:?}"),
        }
        drop(parent_in);
    }

    #[tokio::test]
    async fn test_cancel_frame_reaches_handler() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);
        parent_in
            .write_all(request_line(json!(1)).await.as_bytes())
            .await
            .unwrap();
        parent_in
            .write_all(encode_frame(&ParentFrame::<Value>::Cancel).unwrap().as_bytes())
            .await
            .unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |_: Value, cancel| async move {
            cancel.cancelled().await;
            Err::<Value, _>(HandlerError::Cancelled)
        })
        .await;

        assert_eq!(code, exit_code::CANCELLED);
        let frames = collector.await.unwrap();
        assert!(response(&frames).is_none());
        drop(parent_in);
    }

    #[tokio::test]
    async fn test_wrong_endpoint_is_protocol_error() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);
        let line = encode_frame(&ParentFrame::Request(crate::wire::ChildProcessInput {
            correlation_id: "someone-else".to_string(),
            payload: json!(1),
        }))
        .unwrap();
        parent_in.write_all(line.as_bytes()).await.unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |input: Value, _cancel| async move {
            Ok::<_, HandlerError>(input)
        })
        .await;

        assert_eq!(code, exit_code::PROTOCOL_ERROR);
        assert!(response(&collector.await.unwrap()).is_none());
        drop(parent_in);
    }

    #[tokio::test]
    async fn test_stray_lines_before_request_are_ignored() {
        let (mut parent_in, child_in) = duplex(4096);
        let (child_out, parent_out) = duplex(4096);
        parent_in.write_all(b"not a frame\n").await.unwrap();
        parent_in
            .write_all(request_line(json!("ok")).await.as_bytes())
            .await
            .unwrap();

        let collector = tokio::spawn(frames(parent_out));
        let code = serve(child_in, child_out, &args(), |input: Value, _cancel| async move {
            Ok::<_, HandlerError>(input)
        })
        .await;

        assert_eq!(code, exit_code::SUCCESS);
        assert!(response(&collector.await.unwrap()).is_some());
        drop(parent_in);
    }
}
