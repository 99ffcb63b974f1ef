use std::sync::Arc;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Utc};
use headers::HeaderMapExt;
use log::{error, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::archive::catalog::JsonCatalog;
use crate::archive::config::Config;
use crate::archive::error::ArchiveError;
use crate::archive::orchestrator::{
    ArchiveDownload, DownloadOutcome, DownloadRequest, Orchestrator, SelectorQuery,
};
use crate::archive::progress::{ProgressRecord, ProgressStore};
use crate::archive::storage::HttpObjectStorage;

pub const REQUESTER_HEADER: &str = "x-client-id";
pub const CREDENTIAL_HEADER: &str = "x-gallery-password";
pub const DOWNLOAD_ID_HEADER: &str = "x-download-id";

/// Query of the authenticated download route
#[derive(Deserialize, Debug, Default)]
struct DownloadQuery {
    folder: Option<u64>,
    filter: Option<String>,
    client: Option<String>,
    part: Option<usize>,
}

impl DownloadQuery {
    fn into_request(self, gallery_id: u64) -> Result<DownloadRequest, ArchiveError> {
        let part = self.part;
        let selector = SelectorQuery {
            folder: self.folder,
            filter: self.filter,
            client: self.client,
        }
        .into_selector(gallery_id)?;

        Ok(DownloadRequest { selector, part })
    }
}

#[derive(Deserialize, Debug, Default)]
struct PartQuery {
    part: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct TicketResponse {
    pub url: Url,
    pub expires_at: DateTime<Utc>,
}

pub async fn setup_server(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let catalog = if std::path::Path::new(&config.catalog_path).exists() {
        JsonCatalog::load_from_file(&config.catalog_path)?
    } else {
        warn!("Catalog {} not found, serving an empty catalog", config.catalog_path);
        JsonCatalog::default()
    };
    let catalog = Arc::new(catalog);
    info!("Loaded {} galleries from {}", catalog.gallery_count(), config.catalog_path);

    let storage = Arc::new(HttpObjectStorage::new(Client::new(), config.storage_base_url.clone()));
    let progress = Arc::new(ProgressStore::new());
    let shutdown = CancellationToken::new();
    let sweeper = progress.spawn_sweeper(
        config.progress_sweep_interval(),
        config.progress_retention(),
        shutdown.clone(),
    );

    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        catalog.clone(),
        catalog,
        storage,
        progress,
    ));
    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Binding {} failed", config.listen_addr))?;
    info!("Listening on {}", listener.local_addr()?);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Waiting for ctrl-c failed: {}", err);
            }
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    sweeper.await?;

    Ok(())
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/galleries/{gallery_id}/download", get(download_gallery))
        .route("/galleries/{gallery_id}/download/ticket", post(issue_ticket))
        .route("/download/{ticket}", get(download_with_ticket))
        .route("/progress/{id}", get(progress))
        .layer(Extension(orchestrator))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

async fn download_gallery(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(gallery_id): Path<u64>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> Result<Response, ArchiveError> {
    let request = query.into_request(gallery_id)?;
    orchestrator
        .authorize(
            &request.selector,
            header_str(&headers, REQUESTER_HEADER),
            header_str(&headers, CREDENTIAL_HEADER),
        )
        .await?;

    let outcome = orchestrator.start(&request, None).await?;
    Ok(outcome_response(outcome))
}

async fn issue_ticket(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(gallery_id): Path<u64>,
    headers: HeaderMap,
    Json(query): Json<SelectorQuery>,
) -> Result<Json<TicketResponse>, ArchiveError> {
    let selector = query.into_selector(gallery_id)?;
    let requester = header_str(&headers, REQUESTER_HEADER);
    orchestrator
        .authorize(&selector, requester, header_str(&headers, CREDENTIAL_HEADER))
        .await?;

    let ticket = orchestrator.issue_ticket(requester.map(str::to_string), selector.clone())?;
    let url = orchestrator.fetch_url(&selector, None, Some(&ticket.token))?;

    Ok(Json(TicketResponse {
        url,
        expires_at: ticket.expires_at,
    }))
}

/// The ticket is the whole authorization, nothing else is checked
async fn download_with_ticket(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(ticket): Path<String>,
    Query(query): Query<PartQuery>,
) -> Result<Response, ArchiveError> {
    let payload = orchestrator.redeem_ticket(&ticket)?;
    let request = DownloadRequest {
        selector: payload.selector,
        part: query.part,
    };

    let outcome = orchestrator.start(&request, Some(&ticket)).await?;
    Ok(outcome_response(outcome))
}

async fn progress(
    Extension(orchestrator): Extension<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ProgressRecord>, ArchiveError> {
    orchestrator
        .progress()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ArchiveError::NotFound(format!("download {}", id)))
}

fn outcome_response(outcome: DownloadOutcome) -> Response {
    match outcome {
        DownloadOutcome::Manifest(manifest) => (StatusCode::OK, Json(manifest)).into_response(),
        DownloadOutcome::Archive(download) => archive_response(download),
    }
}

fn archive_response(download: ArchiveDownload) -> Response {
    let mut response = Response::new(Body::from_stream(download.body));
    let response_headers = response.headers_mut();

    response_headers.typed_insert(headers::ContentLength(download.content_length));
    response_headers.typed_insert(headers::CacheControl::new().with_no_store());
    response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/zip"));
    if let Ok(value) = HeaderValue::from_str(&content_disposition(&download.filename)) {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&download.progress_id.to_string()) {
        response_headers.insert(DOWNLOAD_ID_HEADER, value);
    }

    response
}

/// ASCII fallback plus the RFC 5987 form for non-ASCII names
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(filename)
    )
}
