//! switchboard-echo: reference service
//!
//! Serves the `echo` operation on the shared exchange: replies with
//! `{"value": 2 * value}` for a request `{"value": value}`. Useful for
//! checking broker connectivity and end-to-end latency.
//!
//! ## Configuration
//! - SWITCHBOARD_CONFIG: YAML config file (optional)
//! - SWITCHBOARD__MESSAGING__TYPE: `amqp` or `channel`
//! - SWITCHBOARD__MESSAGING__AMQP__URL: broker URL
//! - SWITCHBOARD_LOG: tracing filter (default: info)

use serde::{Deserialize, Serialize};
use tracing::info;

use switchboard::config::Config;
use switchboard::handler::typed;
use switchboard::utils::bootstrap::init_tracing;
use switchboard::{HandlerError, ServiceContext};

const SERVICE_NAME: &str = "echo";

#[derive(Deserialize)]
struct EchoRequest {
    value: i64,
}

#[derive(Serialize)]
struct EchoResponse {
    value: i64,
}

async fn echo(request: EchoRequest) -> Result<EchoResponse, HandlerError> {
    let value = request
        .value
        .checked_mul(2)
        .ok_or_else(|| HandlerError::bad_request("value out of range"))?;
    Ok(EchoResponse { value })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None)?;
    let context = ServiceContext::connect(SERVICE_NAME, config).await?;
    let server = context.server();

    server.register("echo", typed(echo)).await?;

    info!(service = SERVICE_NAME, "switchboard-echo started");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            server.shutdown().await;
        }
    }

    Ok(())
}
