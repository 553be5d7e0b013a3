//! Child executable used by the integration tests.
//!
//! The first argument selects the behavior; the endpoint arguments follow.

use std::time::Duration;

use child_process::{ChildArgs, FailureDescriptor, HandlerError, run_and_listen};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mode = args.first().cloned().unwrap_or_default();

    let code = match ChildArgs::parse(&args) {
        Ok(endpoint) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build();
            match runtime {
                Ok(runtime) => runtime.block_on(serve(mode, endpoint)),
                Err(e) => {
                    eprintln!("failed to build runtime: {e}");
                    1
                }
            }
        }
        Err(e) => {
            eprintln!("{e}");
            child_process::exit_code::PROTOCOL_ERROR
        }
    };

    std::process::exit(code);
}

async fn serve(mode: String, endpoint: ChildArgs) -> i32 {
    if mode == "crash" {
        eprintln!("fixture crashing on purpose");
        std::process::exit(42);
    }

    run_and_listen(&endpoint, move |input: Value, cancel: CancellationToken| {
        handle(mode, input, cancel)
    })
    .await
}

async fn handle(mode: String, input: Value, cancel: CancellationToken) -> Result<Value, HandlerError> {
    match mode.as_str() {
        "echo" => Ok(input),
        "empty" => Ok(Value::Null),
        "stray-output" => {
            println!("plugin chatter on stdout");
            println!("@@ipc-not-quite a frame");
            eprintln!("plugin chatter on stderr");
            Ok(input)
        }
        "fail-not-found" => Err(FailureDescriptor::not_found("detector 'missing' does not exist").into()),
        "transient" => Err(FailureDescriptor::transient("dependency throttled").into()),
        "panic" => panic!("Premature optimization is the root of all evil"),
        "cooperative" => {
            tokio::select! {
                _ = cancel.cancelled() => Err(HandlerError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(60)) => Ok(input),
            }
        }
        "ignore-cancel" => {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(input)
        }
        "stall" => {
            tokio::time::sleep(Duration::from_millis(300)).await;
            // Block the only runtime thread so no more heartbeats go out.
            std::thread::sleep(Duration::from_secs(60));
            Ok(input)
        }
        other => Err(FailureDescriptor::generic(format!("unknown fixture mode '{other}'")).into()),
    }
}
