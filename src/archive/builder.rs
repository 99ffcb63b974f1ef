//!
//! # 归档构建
//! Streams objects from storage into a ZIP archive, one object at a time.
//!
//! Each object is fetched and fully drained into the archive before the next
//! fetch starts, so a download never holds more than one connection to the
//! object store. A failed object is skipped; a failed sink or a cancellation
//! ends the whole archive.
//!

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{error, info, warn};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::archive::error::{ArchiveError, StorageError};
use crate::archive::progress::{ProgressStatus, ProgressStore, ProgressUpdate};
use crate::archive::storage::ObjectStorage;
use crate::archive::target::ArchiveObject;
use crate::archive::zip::ZipWriter;

/// What ended up in a finished archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub entries: usize,
    /// Ids of the objects that were skipped
    pub failed: Vec<u64>,
    pub bytes_written: u64,
}

/// Why a single object did not make it into the archive
enum ObjectFailure {
    /// Storage side, skip and continue
    Upstream(ArchiveError),
    /// Sink side or cancelled, stop everything
    Aborted(String),
}

fn upstream(object: &ArchiveObject, source: StorageError) -> ObjectFailure {
    ObjectFailure::Upstream(ArchiveError::UpstreamObjectError { id: object.id, source })
}

fn timed_out(object: &ArchiveObject, timeout: Duration) -> ObjectFailure {
    upstream(
        object,
        StorageError::IOError(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("no data for {:?}", timeout),
        )),
    )
}

pub struct ArchiveBuilder {
    storage: Arc<dyn ObjectStorage>,
    progress: Arc<ProgressStore>,
    object_timeout: Duration,
    cancel_token: CancellationToken,
}

impl ArchiveBuilder {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        progress: Arc<ProgressStore>,
        object_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            storage,
            progress,
            object_timeout,
            cancel_token,
        }
    }

    /// Write `objects` as a ZIP archive into `sink`, reporting into the
    /// progress record `progress_id`.
    ///
    /// With `declared_len` the archive is padded to exactly that length when
    /// objects had to be skipped.
    pub async fn build<W>(
        &self,
        progress_id: Uuid,
        objects: &[ArchiveObject],
        sink: W,
        declared_len: Option<u64>,
    ) -> Result<BuildSummary, ArchiveError>
    where
        W: AsyncWrite + Unpin,
    {
        let total = objects.len();
        let mut writer = ZipWriter::new(sink);
        let mut failed = Vec::new();

        self.progress
            .update(&progress_id, ProgressUpdate::status(ProgressStatus::Processing));

        for (processed, object) in objects.iter().enumerate() {
            if self.cancel_token.is_cancelled() {
                return Err(self.abort(progress_id, total, "download cancelled".to_string()));
            }

            match self.append_object(&mut writer, object).await {
                Ok(()) => {}
                Err(ObjectFailure::Upstream(err)) => {
                    warn!("Skipping object {} ({}): {}", object.id, object.name, err);
                    failed.push(object.id);
                }
                Err(ObjectFailure::Aborted(message)) => {
                    // writer and sink are dropped on return
                    return Err(self.abort(progress_id, total, message));
                }
            }

            // skipped objects count too, so the record still reaches 100%
            self.progress
                .update(&progress_id, ProgressUpdate::processed(processed + 1));
        }

        let entries = writer.entry_count();
        let bytes_written = match writer.finish(declared_len).await {
            Ok(len) => len,
            Err(err) => {
                return Err(self.abort(progress_id, total, format!("finishing archive failed: {}", err)));
            }
        };

        self.progress.update(
            &progress_id,
            ProgressUpdate {
                status: Some(ProgressStatus::Ready),
                processed_count: Some(total),
                error: None,
            },
        );
        info!(
            "Archive {} finished: {} of {} entries, {} bytes",
            progress_id, entries, total, bytes_written
        );

        Ok(BuildSummary {
            entries,
            failed,
            bytes_written,
        })
    }

    fn abort(&self, progress_id: Uuid, total: usize, message: String) -> ArchiveError {
        error!("Archive {} aborted: {}", progress_id, message);
        self.progress.update(
            &progress_id,
            ProgressUpdate {
                status: Some(ProgressStatus::Error),
                processed_count: Some(total),
                error: Some(message.clone()),
            },
        );

        ArchiveError::StreamAborted(message)
    }

    /// Fetch one object and drain it into the archive before returning
    async fn append_object<W>(&self, writer: &mut ZipWriter<W>, object: &ArchiveObject) -> Result<(), ObjectFailure>
    where
        W: AsyncWrite + Unpin,
    {
        let opened = tokio::select! {
            biased;
            _ = self.cancel_token.cancelled() => {
                return Err(ObjectFailure::Aborted("download cancelled".to_string()));
            }
            opened = tokio::time::timeout(self.object_timeout, self.storage.open_read_stream(&object.storage_key)) => opened,
        };
        let mut stream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(upstream(object, err)),
            Err(_) => return Err(timed_out(object, self.object_timeout)),
        };

        if let Some(len) = stream.len {
            if len > object.size {
                return Err(upstream(
                    object,
                    StorageError::IOError(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("store reports {} bytes, expected at most {}", len, object.size),
                    )),
                ));
            }
        }

        writer
            .start_entry(&object.name)
            .await
            .map_err(|err| ObjectFailure::Aborted(format!("writing archive failed: {}", err)))?;

        loop {
            // 每个数据块都有超时，卡住的连接会被直接丢弃
            let next = tokio::select! {
                biased;
                _ = self.cancel_token.cancelled() => {
                    return Err(ObjectFailure::Aborted("download cancelled".to_string()));
                }
                next = tokio::time::timeout(self.object_timeout, stream.body.next()) => next,
            };

            let bytes = match next {
                Ok(Some(Ok(bytes))) => bytes,
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    writer.abandon_entry();
                    return Err(upstream(object, err));
                }
                Err(_) => {
                    writer.abandon_entry();
                    return Err(timed_out(object, self.object_timeout));
                }
            };

            let written = writer.current_entry_size().unwrap_or(0);
            if written + bytes.len() as u64 > object.size {
                writer.abandon_entry();
                return Err(upstream(
                    object,
                    StorageError::IOError(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("object is larger than the expected {} bytes", object.size),
                    )),
                ));
            }

            writer
                .write_data(&bytes)
                .await
                .map_err(|err| ObjectFailure::Aborted(format!("writing archive failed: {}", err)))?;
        }

        drop(stream);

        let written = writer.current_entry_size().unwrap_or(0);
        if written != object.size {
            writer.abandon_entry();
            return Err(upstream(
                object,
                StorageError::IOError(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("object ended after {} of {} bytes", written, object.size),
                )),
            ));
        }

        writer
            .finish_entry()
            .await
            .map_err(|err| ObjectFailure::Aborted(format!("writing archive failed: {}", err)))
    }
}
