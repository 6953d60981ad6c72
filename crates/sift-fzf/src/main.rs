use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sift_fzf::server::Server;

/// How long one query evaluation may hold a blocking worker.
const QUERY_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(version, about = "Fuzzy path search service")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7070")]
    addr: String,
    /// Base URL of the metadata bucket
    #[arg(long, default_value = "https://meta.sift.codes")]
    meta: String,
    /// Distributions to load at startup instead of on first request
    #[arg(long = "preload")]
    preload: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let meta = url::Url::parse(&args.meta).context("invalid --meta URL")?;
    let commit = commit();

    let server = Arc::new(Server::new(meta, commit));
    for distro in &args.preload {
        let server = Arc::clone(&server);
        let distro = distro.clone();
        tokio::task::spawn_blocking(move || match server.ensure_index(&distro) {
            Ok(_) => {}
            Err(err) => tracing::warn!(distro, error = ?err, "preload failed"),
        })
        .await
        .context("preload worker panicked")?;
    }

    let app = Router::new()
        .route("/", get(welcome))
        .route("/robots.txt", get(robots))
        .route("/{distro}", get(query))
        .with_state(server);

    let listener = tokio::net::TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("failed to bind {}", args.addr))?;
    tracing::info!("listening on {}", args.addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn commit() -> String {
    let mut commit = env::var("SIFT_COMMIT").unwrap_or_else(|_| "dev".to_string());
    commit.truncate(8);
    commit
}

async fn welcome(State(server): State<Arc<Server>>) -> String {
    server.welcome()
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

async fn query(
    State(server): State<Arc<Server>>,
    Path(distro): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let q = params.get("q").cloned();
    let work = tokio::task::spawn_blocking(move || server.handle_query(&distro, q.as_deref()));

    let output = match tokio::time::timeout(QUERY_DEADLINE, work).await {
        Ok(Ok(output)) => output,
        Ok(Err(join_err)) => {
            tracing::error!(error = ?join_err, "query worker panicked");
            return plain(500, sift_internal::http_error_body(500));
        }
        Err(_) => return plain(500, sift_internal::http_error_body(500)),
    };
    plain(output.status, output.body)
}

fn plain(status: u16, body: String) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}
