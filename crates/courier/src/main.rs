//! `courierd`: runs an RPC server from configuration.
//!
//! Registers the built-in `ping` and `echo` handlers, starts serving and
//! shuts down cleanly on Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use courier::bootstrap::bootstrap;
use courier::model::CallRequest;
use courier::{
    Daemon, HandlerError, HandlerOutput, HandlerRegistration, InternalCaller, LifecycleHooks,
    ServerError, StructuredHealthReporter,
};
use serde_json::{Value, json};

async fn ping(_: CallRequest, _: InternalCaller) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::Data(json!("pong")))
}

async fn echo(request: CallRequest, _: InternalCaller) -> Result<HandlerOutput, HandlerError> {
    Ok(HandlerOutput::Data(
        request.args().cloned().unwrap_or(Value::Null),
    ))
}

async fn serve(daemon: &Daemon) -> Result<(), ServerError> {
    let server = daemon.server();
    server
        .register(HandlerRegistration::new("ping").describe("Liveness check"), ping)
        .await?;
    server
        .register(
            HandlerRegistration::new("echo").describe("Returns its arguments"),
            echo,
        )
        .await?;
    daemon
        .run(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %error, "failed to listen for Ctrl-C; shutting down");
            }
        })
        .await
}

#[tokio::main]
async fn main() -> ExitCode {
    let reporter = Arc::new(StructuredHealthReporter::new());
    let daemon = match bootstrap(reporter, LifecycleHooks::default()).await {
        Ok(daemon) => daemon,
        // Already reported by the health reporter.
        Err(_) => return ExitCode::FAILURE,
    };
    match serve(&daemon).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "server failed");
            ExitCode::FAILURE
        }
    }
}
