//! Feed update orchestration: the download, skip, parse, apply, record
//! pipeline every update goes through.
//!
//! The audit row moves CREATED -> SUCCESS | SKIPPED | FAILED. It is written
//! outside the entity transaction, so a failed update leaves a FAILED row
//! and untouched entities.

pub mod realtime;
pub mod static_data;

use chrono::Utc;
use sha2::{Digest, Sha256};

use crate::db::querier::{Querier, QuerierError};
use crate::db::types::{Feed, FeedUpdateStatus, ParserKind, Pk, System};
use crate::gtfs;
use crate::gtfs::realtime::RealtimeParseError;
use crate::gtfs::static_data::StaticParseError;

#[derive(thiserror::Error, Debug)]
pub enum UpdateError {
    #[error("system not found: {0}")]
    SystemNotFound(String),

    #[error("feed not found: {0}")]
    FeedNotFound(String),

    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("feed content is empty")]
    EmptyContent,

    #[error("failed to parse static feed: {0}")]
    StaticParse(#[from] StaticParseError),

    #[error("failed to parse realtime feed: {0}")]
    RealtimeParse(#[from] RealtimeParseError),

    #[error("storage error: {0}")]
    Querier(#[from] QuerierError),
}

pub type UpdateResult<T> = Result<T, UpdateError>;

/// Runs one update of the feed end to end: download the content, skip if it
/// hasn't changed since the last success, otherwise parse and apply it in a
/// single transaction. The returned status is also recorded on the audit
/// row; errors are recorded as FAILED and propagated.
pub async fn create_and_run(
    querier: &dyn Querier,
    http: &reqwest::Client,
    system_id: &str,
    feed_id: &str,
) -> UpdateResult<FeedUpdateStatus> {
    let (system, feed) = resolve(querier, system_id, feed_id).await?;
    let update_pk = querier.insert_feed_update(feed.pk, Utc::now()).await?;
    let outcome = match fetch(http, &feed).await {
        Ok(content) => apply(querier, system.pk, &feed, update_pk, &content).await,
        Err(err) => Err(err),
    };
    finalize(querier, system_id, &feed, update_pk, outcome).await
}

/// Same pipeline as [`create_and_run`], with the content supplied by the
/// caller instead of downloaded. Used for feeds loaded from disk and in
/// tests.
pub async fn create_and_run_with_content(
    querier: &dyn Querier,
    system_id: &str,
    feed_id: &str,
    content: &[u8],
) -> UpdateResult<FeedUpdateStatus> {
    let (system, feed) = resolve(querier, system_id, feed_id).await?;
    let update_pk = querier.insert_feed_update(feed.pk, Utc::now()).await?;
    let outcome = apply(querier, system.pk, &feed, update_pk, content).await;
    finalize(querier, system_id, &feed, update_pk, outcome).await
}

async fn resolve(
    querier: &dyn Querier,
    system_id: &str,
    feed_id: &str,
) -> UpdateResult<(System, Feed)> {
    let system = querier
        .get_system(system_id)
        .await?
        .ok_or_else(|| UpdateError::SystemNotFound(system_id.to_string()))?;
    let feed = querier
        .get_feed(system.pk, feed_id)
        .await?
        .ok_or_else(|| UpdateError::FeedNotFound(feed_id.to_string()))?;
    Ok((system, feed))
}

async fn fetch(http: &reqwest::Client, feed: &Feed) -> UpdateResult<Vec<u8>> {
    let mut request = http.get(&feed.url);
    for (name, value) in &feed.http_headers {
        request = request.header(name, value);
    }
    if let Some(timeout) = feed.http_timeout {
        request = request.timeout(timeout);
    }
    let response = request.send().await?.error_for_status()?;
    Ok(response.bytes().await?.to_vec())
}

/// The skip check and the entity transaction.
async fn apply(
    querier: &dyn Querier,
    system_pk: Pk,
    feed: &Feed,
    update_pk: Pk,
    content: &[u8],
) -> UpdateResult<(FeedUpdateStatus, String)> {
    if content.is_empty() {
        return Err(UpdateError::EmptyContent);
    }
    let content_hash = hex::encode(Sha256::digest(content));
    let last_hash = querier.last_successful_content_hash(feed.pk).await?;
    if last_hash.as_deref() == Some(content_hash.as_str()) {
        return Ok((FeedUpdateStatus::Skipped, content_hash));
    }

    // Parse outside the transaction; only storage work holds it.
    let result = match feed.parser {
        ParserKind::GtfsStatic => {
            let parsed = gtfs::static_data::parse_static_zip(content).await?;
            querier.begin().await?;
            static_data::run_static_update(querier, system_pk, feed, update_pk, &parsed).await
        }
        ParserKind::GtfsRealtime => {
            let parsed = gtfs::realtime::parse_realtime(content)?;
            querier.begin().await?;
            realtime::run_realtime_update(querier, system_pk, feed, update_pk, &parsed).await
        }
    };
    match result {
        Ok(()) => {
            querier.commit().await?;
            Ok((FeedUpdateStatus::Success, content_hash))
        }
        Err(err) => {
            querier.rollback().await?;
            Err(err.into())
        }
    }
}

async fn finalize(
    querier: &dyn Querier,
    system_id: &str,
    feed: &Feed,
    update_pk: Pk,
    outcome: UpdateResult<(FeedUpdateStatus, String)>,
) -> UpdateResult<FeedUpdateStatus> {
    match outcome {
        Ok((status, content_hash)) => {
            querier
                .finish_feed_update(update_pk, status, Some(content_hash), None, Utc::now())
                .await?;
            log::info!(
                "Update {} for feed {}/{} finished: {:?}",
                update_pk,
                system_id,
                feed.id,
                status
            );
            Ok(status)
        }
        Err(err) => {
            querier
                .finish_feed_update(
                    update_pk,
                    FeedUpdateStatus::Failed,
                    None,
                    Some(err.to_string()),
                    Utc::now(),
                )
                .await?;
            log::error!(
                "Update {} for feed {}/{} failed: {}",
                update_pk,
                system_id,
                feed.id,
                err
            );
            Err(err)
        }
    }
}
