//! Chunked persistence of the opaque session artifact.
//!
//! The record service only accepts small text payloads per record, so the
//! multi-megabyte artifact is gzipped, base64-encoded and split into
//! fixed-size fragments. A save deletes the previous generation before
//! writing the new one: the service has no transactional batch write, and
//! delete-before-write is the only ordering that keeps a reader from ever
//! seeing chunks of two generations mixed together.

use crate::error::Error;
use crate::records::{RecordService, SessionFragment, StoredFragment};
use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use futures_util::future::join_all;
use std::io::{Read, Write};
use std::sync::Arc;

pub struct BlobStore {
    records: Arc<dyn RecordService>,
    max_chunk_size: usize,
}

impl BlobStore {
    pub fn new(records: Arc<dyn RecordService>, max_chunk_size: usize) -> Self {
        Self {
            records,
            max_chunk_size: max_chunk_size.max(1),
        }
    }

    /// Persist `blob` as the new fragment generation for `session_id`.
    ///
    /// Writes are strictly sequential in chunk order so a partially written
    /// generation is still a prefix, never a scramble.
    pub async fn save(&self, session_id: &str, blob: &[u8]) -> Result<(), Error> {
        let (encoded, compressed) = encode(blob).map_err(Error::BlobPersistence)?;
        let chunks = split_chunks(&encoded, self.max_chunk_size);
        let total = chunks.len() as u32;

        self.purge(session_id)
            .await
            .map_err(Error::BlobPersistence)?;

        let now = Utc::now();
        for (index, payload) in chunks.into_iter().enumerate() {
            let fragment = SessionFragment {
                session_id: session_id.to_string(),
                chunk_index: index as u32,
                total_chunks: total,
                payload,
                compressed,
                active: true,
                timestamp: now,
            };
            self.records
                .create_fragment(&fragment)
                .await
                .with_context(|| format!("fragment {index}/{total} write failed"))
                .map_err(Error::BlobPersistence)?;
        }

        tracing::info!(
            session = %session_id,
            chunks = total,
            bytes = blob.len(),
            "session artifact persisted"
        );
        Ok(())
    }

    /// Reconstruct the artifact, or `None` when no prior session exists.
    pub async fn extract(&self, session_id: &str) -> Result<Option<Vec<u8>>, Error> {
        let mut fragments: Vec<StoredFragment> = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let page = self
                .records
                .list_fragments(session_id, true, offset.as_deref())
                .await
                .map_err(Error::BlobPersistence)?;
            fragments.extend(page.fragments);
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        if fragments.is_empty() {
            return Ok(None);
        }

        fragments.sort_by_key(|f| f.fragment.chunk_index);

        // Best-effort recovery beats strict validation here: rejecting a
        // short generation would lock the user out of their session.
        let declared = fragments[0].fragment.total_chunks as usize;
        if fragments.len() != declared
            || fragments
                .iter()
                .any(|f| f.fragment.total_chunks as usize != declared)
        {
            tracing::warn!(
                session = %session_id,
                retrieved = fragments.len(),
                declared,
                "fragment count does not match declared total, reconstructing from what was retrieved"
            );
        }

        let encoded: String = fragments
            .iter()
            .map(|f| f.fragment.payload.as_str())
            .collect();
        let decoded = BASE64
            .decode(encoded.trim())
            .context("fragment payload is not valid base64")
            .map_err(Error::BlobPersistence)?;

        if !fragments.iter().any(|f| f.fragment.compressed) {
            return Ok(Some(decoded));
        }

        let mut decompressed = Vec::new();
        match GzDecoder::new(decoded.as_slice()).read_to_end(&mut decompressed) {
            Ok(_) => Ok(Some(decompressed)),
            Err(e) => {
                tracing::warn!(
                    session = %session_id,
                    error = %e,
                    "decompression failed, treating decoded payload as the raw artifact"
                );
                Ok(Some(decoded))
            }
        }
    }

    /// Remove every fragment for `session_id`, active or not.
    pub async fn delete(&self, session_id: &str) -> Result<(), Error> {
        self.purge(session_id).await.map_err(Error::BlobPersistence)
    }

    /// Enumerate all fragments across pages and delete each by record id.
    /// Individual delete failures are logged and the batch continues; the
    /// deletions themselves are independent records and run concurrently.
    async fn purge(&self, session_id: &str) -> Result<()> {
        let mut record_ids = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let page = self
                .records
                .list_fragments(session_id, false, offset.as_deref())
                .await?;
            record_ids.extend(page.fragments.into_iter().map(|f| f.record_id));
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        let deletes = record_ids.iter().map(|record_id| {
            let records = Arc::clone(&self.records);
            async move { (record_id, records.delete_fragment(record_id).await) }
        });
        for (record_id, result) in join_all(deletes).await {
            if let Err(e) = result {
                tracing::warn!(record = %record_id, "fragment delete failed: {e}");
            }
        }
        Ok(())
    }
}

/// Gzip + base64. A zero-length blob skips compression so it round-trips to
/// a single fragment with an empty payload.
fn encode(blob: &[u8]) -> Result<(String, bool)> {
    if blob.is_empty() {
        return Ok((String::new(), false));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(blob).context("compression failed")?;
    let compressed = encoder.finish().context("compression failed")?;
    Ok((BASE64.encode(compressed), true))
}

/// Split the encoded text into `size`-character chunks; always at least one.
fn split_chunks(encoded: &str, size: usize) -> Vec<String> {
    if encoded.is_empty() {
        return vec![String::new()];
    }
    // base64 output is ASCII, so byte chunks are char chunks.
    encoded
        .as_bytes()
        .chunks(size)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}
