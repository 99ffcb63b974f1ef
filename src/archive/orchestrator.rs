//!
//! # 下载编排
//! Turns a download request into either a streaming archive or a manifest of
//! parts, and owns the lifecycle of the archive task it starts.
//!

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::archive::builder::ArchiveBuilder;
use crate::archive::catalog::{AuthorizationOracle, TargetResolver};
use crate::archive::config::Config;
use crate::archive::error::ArchiveError;
use crate::archive::partition::{find_part, partition};
use crate::archive::progress::ProgressStore;
use crate::archive::storage::ObjectStorage;
use crate::archive::strategy::{select_strategy, DownloadStrategy};
use crate::archive::target::{ArchiveObject, DownloadSelector};
use crate::archive::ticket::{IssuedTicket, TicketCodec, TicketPayload};
use crate::archive::zip::{archive_len, fits_store_mode, name_fits, MAX_NAME_LEN};

/// Buffer between the archive task and the response body
const PIPE_CAPACITY: usize = 256 * 1024;

/// Selector as it travels in a query string
#[derive(Deserialize, Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct SelectorQuery {
    pub folder: Option<u64>,
    pub filter: Option<String>,
    pub client: Option<String>,
}

impl SelectorQuery {
    pub fn from_selector(selector: &DownloadSelector) -> Self {
        match selector {
            DownloadSelector::Gallery { .. } => Self::default(),
            DownloadSelector::Folder { folder_id, .. } => Self {
                folder: Some(*folder_id),
                ..Default::default()
            },
            DownloadSelector::Liked { client_id, .. } => Self {
                filter: Some("liked".to_string()),
                client: Some(client_id.clone()),
                ..Default::default()
            },
            DownloadSelector::Favorited { client_id, .. } => Self {
                filter: Some("favorited".to_string()),
                client: Some(client_id.clone()),
                ..Default::default()
            },
        }
    }

    pub fn into_selector(self, gallery_id: u64) -> Result<DownloadSelector, ArchiveError> {
        match (self.folder, self.filter.as_deref()) {
            (Some(_), Some(_)) => Err(ArchiveError::InvalidRequest(
                "folder and filter cannot be combined".to_string(),
            )),
            (Some(folder_id), None) => Ok(DownloadSelector::Folder { gallery_id, folder_id }),
            (None, None) => Ok(DownloadSelector::Gallery { gallery_id }),
            (None, Some(filter)) => {
                let client_id = self
                    .client
                    .filter(|client| !client.is_empty())
                    .ok_or_else(|| ArchiveError::InvalidRequest(format!("filter {} needs a client", filter)))?;

                match filter {
                    "liked" => Ok(DownloadSelector::Liked { gallery_id, client_id }),
                    "favorited" => Ok(DownloadSelector::Favorited { gallery_id, client_id }),
                    other => Err(ArchiveError::InvalidRequest(format!("unknown filter {}", other))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub selector: DownloadSelector,
    /// 1-based part index
    pub part: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManifestPart {
    pub part_index: usize,
    pub filename: String,
    pub byte_size: u64,
    pub object_count: usize,
    pub fetch_url: Url,
}

#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub strategy: DownloadStrategy,
    pub archive_name: String,
    pub total_size: u64,
    pub estimated_parts: u64,
    pub parts: Vec<ManifestPart>,
}

/// A running archive. The body ends with an error item if the archive could
/// not be completed.
pub struct ArchiveDownload {
    pub progress_id: Uuid,
    pub filename: String,
    pub content_length: u64,
    pub object_count: usize,
    pub body: BoxStream<'static, io::Result<Bytes>>,
}

pub enum DownloadOutcome {
    Archive(ArchiveDownload),
    Manifest(Manifest),
}

pub struct Orchestrator {
    config: Arc<Config>,
    resolver: Arc<dyn TargetResolver>,
    oracle: Arc<dyn AuthorizationOracle>,
    storage: Arc<dyn ObjectStorage>,
    progress: Arc<ProgressStore>,
    tickets: TicketCodec,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        resolver: Arc<dyn TargetResolver>,
        oracle: Arc<dyn AuthorizationOracle>,
        storage: Arc<dyn ObjectStorage>,
        progress: Arc<ProgressStore>,
    ) -> Self {
        let secret = config.ticket_secret.clone().unwrap_or_else(|| {
            warn!("No ticket_secret configured, download tickets will not survive a restart");
            format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
        });
        let tickets = TicketCodec::new(secret, config.ticket_ttl());

        Self {
            config,
            resolver,
            oracle,
            storage,
            progress,
            tickets,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn progress(&self) -> &Arc<ProgressStore> {
        &self.progress
    }

    pub async fn authorize(
        &self,
        selector: &DownloadSelector,
        requester: Option<&str>,
        credential: Option<&str>,
    ) -> Result<(), ArchiveError> {
        if self.oracle.is_authorized(selector, requester, credential).await {
            Ok(())
        } else {
            Err(ArchiveError::Unauthorized("access denied".to_string()))
        }
    }

    /// Sign a ticket for an already authorized selector
    pub fn issue_ticket(&self, requester: Option<String>, selector: DownloadSelector) -> Result<IssuedTicket, ArchiveError> {
        let payload = TicketPayload::new(requester, selector);
        Ok(self.tickets.issue(&payload)?)
    }

    pub fn redeem_ticket(&self, token: &str) -> Result<TicketPayload, ArchiveError> {
        Ok(self.tickets.verify(token)?)
    }

    /// Where a part (or the whole download) can be fetched with a single GET
    pub fn fetch_url(
        &self,
        selector: &DownloadSelector,
        part: Option<usize>,
        ticket: Option<&str>,
    ) -> Result<Url, ArchiveError> {
        let path = match ticket {
            Some(token) => format!("download/{}", token),
            None => format!("galleries/{}/download", selector.gallery_id()),
        };
        let mut url = self
            .config
            .public_base_url
            .join(&path)
            .map_err(|err| ArchiveError::InvalidRequest(err.to_string()))?;

        {
            let mut pairs = url.query_pairs_mut();
            if ticket.is_none() {
                let query = SelectorQuery::from_selector(selector);
                if let Some(folder) = query.folder {
                    pairs.append_pair("folder", &folder.to_string());
                }
                if let Some(filter) = &query.filter {
                    pairs.append_pair("filter", filter);
                }
                if let Some(client) = &query.client {
                    pairs.append_pair("client", client);
                }
            }
            if let Some(part) = part {
                pairs.append_pair("part", &part.to_string());
            }
        }

        // drop the dangling `?` when no pair was added
        if url.query() == Some("") {
            url.set_query(None);
        }

        Ok(url)
    }

    /// `ticket` is the token the request came in with, manifest URLs carry it on
    pub async fn start(&self, request: &DownloadRequest, ticket: Option<&str>) -> Result<DownloadOutcome, ArchiveError> {
        let selector = &request.selector;
        let resolved = self
            .resolver
            .resolve(selector)
            .await?
            .ok_or_else(|| ArchiveError::NotFound(format!("gallery {}", selector.gallery_id())))?;

        if resolved.is_expired(Utc::now()) {
            return Err(ArchiveError::Expired);
        }
        if resolved.target.is_empty() {
            return Err(ArchiveError::NotFound("no photos in this selection".to_string()));
        }

        let chunk_size = self.config.chunk_size_bytes;
        let target = &resolved.target;
        let decision = select_strategy(target, self.config.multipart_enabled, chunk_size);

        match (decision.strategy, request.part) {
            (DownloadStrategy::DirectStream, None) | (DownloadStrategy::DirectStream, Some(1)) => {
                let filename = format!("{}.zip", resolved.archive_name);
                self.stream(target.objects().to_vec(), filename).map(DownloadOutcome::Archive)
            }
            (DownloadStrategy::DirectStream, Some(index)) => Err(ArchiveError::PartNotFound(index)),
            (DownloadStrategy::MultipartManifest, Some(index)) => {
                let part = find_part(target, chunk_size, &resolved.archive_name, index)
                    .ok_or(ArchiveError::PartNotFound(index))?;
                self.stream(part.objects(target).to_vec(), part.filename)
                    .map(DownloadOutcome::Archive)
            }
            (DownloadStrategy::MultipartManifest, None) => {
                let parts = partition(target, chunk_size, &resolved.archive_name)
                    .into_iter()
                    .map(|part| {
                        Ok(ManifestPart {
                            fetch_url: self.fetch_url(selector, Some(part.index), ticket)?,
                            part_index: part.index,
                            filename: part.filename,
                            byte_size: part.byte_size,
                            object_count: part.object_count,
                        })
                    })
                    .collect::<Result<Vec<_>, ArchiveError>>()?;

                info!(
                    "Manifest for {:?}: {} bytes in {} parts",
                    selector,
                    decision.total_size,
                    parts.len()
                );

                Ok(DownloadOutcome::Manifest(Manifest {
                    strategy: decision.strategy,
                    archive_name: resolved.archive_name,
                    total_size: decision.total_size,
                    estimated_parts: decision.estimated_parts,
                    parts,
                }))
            }
        }
    }

    /// Start the archive task and hand back the read side
    fn stream(&self, objects: Vec<ArchiveObject>, filename: String) -> Result<ArchiveDownload, ArchiveError> {
        if let Some(object) = objects.iter().find(|object| !name_fits(&object.name)) {
            return Err(ArchiveError::InvalidRequest(format!(
                "entry name of object {} is longer than {} bytes",
                object.id, MAX_NAME_LEN
            )));
        }

        let content_length = archive_len(&objects);
        if !fits_store_mode(content_length, objects.len()) {
            return Err(ArchiveError::ArchiveTooLarge(content_length));
        }

        let object_count = objects.len();
        let progress_id = self.progress.create(filename.clone(), object_count);
        info!(
            "Streaming {} as {} ({} objects, {} bytes)",
            progress_id, filename, object_count, content_length
        );

        let (sink, reader) = tokio::io::duplex(PIPE_CAPACITY);
        let cancel_token = CancellationToken::new();
        let builder = ArchiveBuilder::new(
            self.storage.clone(),
            self.progress.clone(),
            self.config.object_timeout(),
            cancel_token.clone(),
        );
        let (done_sender, done_receiver) = oneshot::channel::<Result<(), String>>();
        let progress = self.progress.clone();
        let cleanup_delay = self.config.progress_cleanup_delay();

        tokio::spawn(async move {
            let result = builder
                .build(progress_id, &objects, sink, Some(content_length))
                .await;
            progress.schedule_delete(progress_id, cleanup_delay);
            let _ = done_sender.send(result.map(|_| ()).map_err(|err| err.to_string()));
        });

        // 响应体被丢弃（客户端断开，或从未被读取）时取消构建
        let guard = cancel_token.drop_guard();
        let body = async_stream::stream! {
            let _guard = guard;
            let mut chunks = ReaderStream::new(reader);
            while let Some(chunk) = chunks.next().await {
                yield chunk;
            }

            match done_receiver.await {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    yield Err(io::Error::other(message));
                }
                Err(_) => {
                    yield Err(io::Error::other("archive task stopped unexpectedly"));
                }
            }
        };

        Ok(ArchiveDownload {
            progress_id,
            filename,
            content_length,
            object_count,
            body: body.boxed(),
        })
    }
}
