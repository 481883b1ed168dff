use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use clap::Parser;
use inference::{load_model, Overrides, Responder};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tch::Device;
use tracing::{info, warn};

#[derive(Parser)]
#[command(about = "Serve replies of a trained seq2seq chatbot")]
struct Cli {
    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,
    #[arg(long, default_value_t = 8000)]
    port: u16,
    /// Decode with beam search regardless of the trained configuration.
    #[arg(long)]
    beam_search: bool,
    #[arg(long)]
    beam_size: Option<i64>,
}

#[derive(Clone)]
struct AppState {
    responder: Arc<Mutex<Responder>>,
}

#[derive(Deserialize)]
struct ReplyRequest {
    tokens: Vec<i64>,
    #[serde(default)]
    context: Option<Vec<f32>>,
}

#[derive(Serialize)]
struct ReplyResponse {
    tokens: Vec<i64>,
}

async fn reply_handler(
    State(state): State<AppState>,
    Json(req): Json<ReplyRequest>,
) -> Result<Json<ReplyResponse>, (StatusCode, String)> {
    info!("reply request with {} tokens", req.tokens.len());

    let responder = Arc::clone(&state.responder);
    let reply = tokio::task::spawn_blocking(move || {
        let mut responder = responder
            .lock()
            .map_err(|_| anyhow::anyhow!("responder lock poisoned"))?;
        responder.reply(&req.tokens, req.context)
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    match reply {
        Ok(tokens) => Ok(Json(ReplyResponse { tokens })),
        Err(e) => {
            warn!("reply failed: {:#}", e);
            Err((StatusCode::UNPROCESSABLE_ENTITY, format!("{:#}", e)))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let device = Device::cuda_if_available();
    info!("Using device: {:?}", device);

    let overrides = Overrides {
        beam_search: cli.beam_search.then_some(true),
        beam_size: cli.beam_size,
    };
    let session = load_model(&cli.checkpoint_dir, device, &overrides)?;

    let state = AppState {
        responder: Arc::new(Mutex::new(Responder::new(session))),
    };

    let app = Router::new()
        .route("/reply", post(reply_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    info!("Chatbot server listening on {}", addr);

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
