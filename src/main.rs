use axum::http::StatusCode;
use hfstream::app::{build_app, load_state};
use hfstream::error::AppError;
use std::net::SocketAddr;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hfstream=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        tracing::error!(code = %err.code, "{}", err.message);
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

fn startup_error(code: &'static str, err: impl std::fmt::Display) -> AppError {
    AppError::new(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
}

async fn run() -> Result<(), AppError> {
    let state = load_state()?;
    let addr = state
        .config
        .listen
        .parse::<SocketAddr>()
        .map_err(|err| startup_error("listen_invalid", err))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| startup_error("listen_failed", err))?;

    tracing::info!(
        %addr,
        default_model = %state.config.default_model,
        base_url = %state.config.base_url,
        credential = state.config.has_credential(),
        "hfstream listening"
    );
    axum::serve(listener, build_app(state))
        .await
        .map_err(|err| startup_error("serve_failed", err))
}
