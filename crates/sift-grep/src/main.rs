use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use clap::{Args, Parser, Subcommand};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing_subscriber::EnvFilter;

use sift_grep::server::{self, GrepRequest, GrepServer};
use sift_grep::update::{self, UpdateOptions};

#[derive(Parser, Debug)]
#[command(version, about = "Regex code search service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve search queries from the local data directories
    Serve(ServeArgs),
    /// Sync indexes and sources from the published artifacts
    Update(CommonArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Path to the distribution configuration file
    #[arg(long, default_value = "distributions.toml")]
    config: PathBuf,
    /// Directory for bulk data (HDD)
    #[arg(long = "bulk-data", default_value = "/data")]
    bulk_dir: PathBuf,
    /// Directory for fast data (SSD)
    #[arg(long = "fast-data", default_value = "/data")]
    fast_dir: PathBuf,
    /// Base URL of the per-package artifact bucket
    #[arg(long, default_value = "https://ls.sift.codes")]
    ls: String,
    /// Base URL of the metadata bucket
    #[arg(long, default_value = "https://meta.sift.codes")]
    meta: String,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:5050")]
    addr: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve(args) => serve(args),
        Command::Update(args) => run_update(args),
    };
    match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = ?err, "fatal");
            ExitCode::FAILURE
        }
    }
}

fn distro_names(config_path: &std::path::Path) -> Result<Vec<String>> {
    let config = sift_internal::load_config(config_path)?;
    Ok(config.distributions.keys().cloned().collect())
}

fn run_update(args: CommonArgs) -> Result<ExitCode> {
    let distros = distro_names(&args.config)?;
    let options = UpdateOptions {
        meta: url::Url::parse(&args.meta).context("invalid --meta URL")?,
        ls: url::Url::parse(&args.ls).context("invalid --ls URL")?,
        fast_dir: args.fast_dir,
        bulk_dir: args.bulk_dir,
    };
    let clean = update::update(&options, &distros)?;
    tracing::info!("done");
    if clean {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn serve(args: ServeArgs) -> Result<ExitCode> {
    let distros = distro_names(&args.common.config)?;
    let server = Arc::new(GrepServer::load(
        &args.common.fast_dir,
        &args.common.bulk_dir,
        &distros,
        commit(),
    )?);

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async {
        let app = Router::new()
            .route("/", get(welcome))
            .route("/robots.txt", get(robots))
            .route("/{distro}", get(search))
            .with_state(server);
        let listener = tokio::net::TcpListener::bind(&args.addr)
            .await
            .with_context(|| format!("failed to bind {}", args.addr))?;
        tracing::info!("listening on {}", args.addr);
        axum::serve(listener, app).await?;
        Ok(ExitCode::SUCCESS)
    })
}

fn commit() -> String {
    let mut commit = env::var("SIFT_COMMIT").unwrap_or_else(|_| "dev".to_string());
    commit.truncate(8);
    commit
}

async fn welcome(State(server): State<Arc<GrepServer>>) -> String {
    server.welcome()
}

async fn robots() -> &'static str {
    "User-agent: *\nDisallow: /\n"
}

async fn search(
    State(server): State<Arc<GrepServer>>,
    Path(distro): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let request = parse_query(raw_query.as_deref().unwrap_or(""));
    let prepared = match server.prepare(&distro, &request) {
        Ok(prepared) => prepared,
        Err(code) => return error_response(code),
    };

    let content_type = server::response_content_type(
        header_str(&headers, header::USER_AGENT),
        header_str(&headers, "sec-fetch-mode"),
    );

    // Records stream to the client as they are found; dropping the receiver
    // (client gone) aborts the scan.
    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    tokio::task::spawn_blocking(move || {
        let mut sink = |record: String| tx.blocking_send(record).is_ok();
        let summary = server.execute(&distro, &prepared, &mut sink);
        let _ = tx.blocking_send(GrepServer::trailer(&prepared, &summary));
    });

    let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, std::convert::Infallible>(chunk));
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}

fn header_str<'a, K>(headers: &'a HeaderMap, key: K) -> &'a str
where
    K: axum::http::header::AsHeaderName,
{
    headers.get(key).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Parses the raw query string by hand so repeated `include`/`exclude`
/// parameters accumulate.
fn parse_query(raw: &str) -> GrepRequest {
    let mut request = GrepRequest {
        query: String::new(),
        flags: String::new(),
        context: 0,
        include: Vec::new(),
        exclude: Vec::new(),
        after: None,
    };
    for pair in raw.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value);
        match key {
            "q" => request.query = value,
            "flags" => request.flags = value,
            "context" => request.context = value.parse().unwrap_or(0),
            "include" => request.include.push(value),
            "exclude" => request.exclude.push(value),
            "after" => request.after = Some(value),
            _ => {}
        }
    }
    request
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn error_response(code: u16) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        sift_internal::http_error_body(code),
    )
        .into_response()
}
