//! # servicekit demo
//!
//! A service with an in-process bus, two HTTP routes and a background
//! subscriber:
//!
//! - `GET /ping` answers `pong`.
//! - `POST /events/{channel}` publishes the JSON body on `channel`.
//! - The `chat-logger` component logs everything posted to `chat`.
//!
//! ```bash
//! cargo run -p servicekit-demo -- --http-port=8080
//! curl -XPOST localhost:8080/events/chat -d '{"text":"hi"}' -H 'content-type: application/json'
//! ```
//!
//! Every flag can also be set through the environment or `.env`; run with
//! `--print-env` to get a template.

mod chat;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chat::ChatLogger;
use servicekit::pubsub::{Event, LocalPubSub, PubSub};
use servicekit::{ConfigError, ServiceBuilder, ServiceError};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let print_env = std::env::args().any(|arg| arg == "--print-env");
    let args: Vec<String> = std::env::args()
        .skip(1)
        .filter(|arg| arg != "--print-env")
        .collect();

    let bus = LocalPubSub::new("pubsub");
    let shared = Arc::new(bus.clone());

    let service = ServiceBuilder::new()
        .name("demo")
        .version("0.1.0")
        .with_args(args)
        .with_init_runnable(bus)
        .with_runnable(ChatLogger::new(shared.clone(), "chat"))
        .build();
    let service = match service {
        Err(ServiceError::Config(ConfigError::Help(usage))) => {
            print!("{usage}");
            return Ok(());
        }
        other => other?,
    };

    if print_env {
        service.out_env();
        return Ok(());
    }

    service.http_server().add_handler(move |router| {
        let events = Router::new()
            .route("/events/{channel}", post(publish))
            .with_state(shared);
        router.route("/ping", get(|| async { "pong" })).merge(events)
    });

    service.init().await?;
    info!(env = %service.env(), uri = %service.http_server().uri(), "demo ready");

    if let Err(e) = service.start().await {
        error!(error = %e, "service failed");
        return Err(e.into());
    }
    Ok(())
}

async fn publish(
    State(bus): State<Arc<LocalPubSub>>,
    Path(channel): Path<String>,
    Json(data): Json<serde_json::Value>,
) -> Result<StatusCode, (StatusCode, String)> {
    if !bus.is_running() {
        return Err((StatusCode::SERVICE_UNAVAILABLE, "bus is not running".into()));
    }
    bus.publish(&channel.into(), Event::new("http", data))
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(StatusCode::ACCEPTED)
}
