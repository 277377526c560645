//! Relational state store backed by Postgres.
//!
//! One `au_states` row per AU. Crawl-result messages and CDN stems are
//! resolved through find-or-create lookups into their normalized side
//! tables; side tables are only touched when their fields changed. Rows are
//! written as a full upsert inside one transaction, so a partial update is
//! still atomic with its side-table maintenance.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::models::au_state::{
    fields, AccessType, AuStateBean, ClockssSubscriptionStatus, CrawlResult, PollResult,
    SubstanceState,
};
use crate::models::suspect_versions::{AuSuspectUrlVersionsBean, SuspectUrlVersion};
use crate::models::FieldSet;
use crate::services::state_store::StateStore;

/// Postgres adapter for `AuStateBean`.
pub struct PgAuStateStore {
    pool: PgPool,
}

impl PgAuStateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Row projection with the message texts already joined in.
#[derive(sqlx::FromRow)]
struct AuStateRow {
    au_id: String,
    au_creation_time: i64,
    last_crawl_time: i64,
    last_crawl_attempt: i64,
    last_crawl_result: String,
    last_crawl_result_msg: Option<String>,
    last_deep_crawl_time: i64,
    last_deep_crawl_attempt: i64,
    last_deep_crawl_result: String,
    last_deep_crawl_result_msg: Option<String>,
    last_deep_crawl_depth: i32,
    last_top_level_poll: i64,
    last_poll_result: String,
    last_poll_attempt: i64,
    average_poll_duration: i64,
    last_pop_poll: i64,
    last_pop_poll_result: String,
    last_local_hash_scan: i64,
    last_local_hash_result: String,
    average_hash_duration: i64,
    clockss_subscription_status: String,
    access_type: Option<String>,
    substance_state: String,
    substance_version: Option<String>,
    metadata_version: Option<String>,
    last_metadata_index: i64,
    last_content_change: i64,
    num_agree_peers_last_por: i32,
    num_willing_repairers: i32,
    num_currently_suspect_versions: i32,
}

impl AuStateRow {
    fn into_bean(self, cdn_stems: Vec<String>) -> AuStateBean {
        AuStateBean {
            au_id: self.au_id,
            au_creation_time: self.au_creation_time,
            last_crawl_time: self.last_crawl_time,
            last_crawl_attempt: self.last_crawl_attempt,
            last_crawl_result: CrawlResult::parse(&self.last_crawl_result),
            last_crawl_result_msg: self.last_crawl_result_msg,
            last_deep_crawl_time: self.last_deep_crawl_time,
            last_deep_crawl_attempt: self.last_deep_crawl_attempt,
            last_deep_crawl_result: CrawlResult::parse(&self.last_deep_crawl_result),
            last_deep_crawl_result_msg: self.last_deep_crawl_result_msg,
            last_deep_crawl_depth: self.last_deep_crawl_depth,
            last_top_level_poll: self.last_top_level_poll,
            last_poll_result: PollResult::parse(&self.last_poll_result),
            last_poll_attempt: self.last_poll_attempt,
            average_poll_duration: self.average_poll_duration,
            last_pop_poll: self.last_pop_poll,
            last_pop_poll_result: PollResult::parse(&self.last_pop_poll_result),
            last_local_hash_scan: self.last_local_hash_scan,
            last_local_hash_result: PollResult::parse(&self.last_local_hash_result),
            average_hash_duration: self.average_hash_duration,
            clockss_subscription_status: ClockssSubscriptionStatus::parse(
                &self.clockss_subscription_status,
            ),
            access_type: self.access_type.as_deref().and_then(AccessType::parse),
            substance_state: SubstanceState::parse(&self.substance_state),
            substance_version: self.substance_version,
            metadata_version: self.metadata_version,
            last_metadata_index: self.last_metadata_index,
            last_content_change: self.last_content_change,
            num_agree_peers_last_por: self.num_agree_peers_last_por,
            num_willing_repairers: self.num_willing_repairers,
            num_currently_suspect_versions: self.num_currently_suspect_versions,
            cdn_stems,
        }
    }
}

/// Find-or-create a normalized crawl-result message, returning its id.
async fn message_id(
    tx: &mut Transaction<'_, Postgres>,
    message: Option<&str>,
) -> Result<Option<i64>> {
    let Some(message) = message else {
        return Ok(None);
    };
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO crawl_result_messages (message) VALUES ($1)
        ON CONFLICT (message) DO UPDATE SET message = EXCLUDED.message
        RETURNING id
        "#,
    )
    .bind(message)
    .fetch_one(&mut **tx)
    .await?;
    Ok(Some(id))
}

/// Find-or-create a normalized CDN stem, returning its id.
async fn stem_id(tx: &mut Transaction<'_, Postgres>, stem: &str) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO cdn_stems (stem) VALUES ($1)
        ON CONFLICT (stem) DO UPDATE SET stem = EXCLUDED.stem
        RETURNING id
        "#,
    )
    .bind(stem)
    .fetch_one(&mut **tx)
    .await?;
    Ok(id)
}

#[async_trait]
impl StateStore<AuStateBean> for PgAuStateStore {
    async fn find(&self, key: &str) -> Result<Option<AuStateBean>> {
        let row: Option<AuStateRow> = sqlx::query_as(
            r#"
            SELECT
                a.au_id, a.au_creation_time,
                a.last_crawl_time, a.last_crawl_attempt, a.last_crawl_result,
                m1.message AS last_crawl_result_msg,
                a.last_deep_crawl_time, a.last_deep_crawl_attempt,
                a.last_deep_crawl_result,
                m2.message AS last_deep_crawl_result_msg,
                a.last_deep_crawl_depth,
                a.last_top_level_poll, a.last_poll_result, a.last_poll_attempt,
                a.average_poll_duration,
                a.last_pop_poll, a.last_pop_poll_result,
                a.last_local_hash_scan, a.last_local_hash_result,
                a.average_hash_duration,
                a.clockss_subscription_status, a.access_type,
                a.substance_state, a.substance_version, a.metadata_version,
                a.last_metadata_index, a.last_content_change,
                a.num_agree_peers_last_por, a.num_willing_repairers,
                a.num_currently_suspect_versions
            FROM au_states a
            LEFT JOIN crawl_result_messages m1 ON m1.id = a.last_crawl_result_msg_id
            LEFT JOIN crawl_result_messages m2 ON m2.id = a.last_deep_crawl_result_msg_id
            WHERE a.au_id = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let cdn_stems: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT s.stem FROM au_cdn_stems j
            JOIN cdn_stems s ON s.id = j.stem_id
            WHERE j.au_id = $1
            ORDER BY j.ord
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(row.into_bean(cdn_stems)))
    }

    async fn update(
        &self,
        key: &str,
        record: &AuStateBean,
        changed: &FieldSet,
    ) -> Result<String> {
        let mut tx = self.pool.begin().await?;

        // The row is upserted whole, so the message ids are always resolved;
        // find-or-create keeps the side table duplicate-free either way.
        let msg_id = message_id(&mut tx, record.last_crawl_result_msg.as_deref()).await?;
        let deep_msg_id =
            message_id(&mut tx, record.last_deep_crawl_result_msg.as_deref()).await?;

        sqlx::query(
            r#"
            INSERT INTO au_states (
                au_id, au_creation_time,
                last_crawl_time, last_crawl_attempt, last_crawl_result,
                last_crawl_result_msg_id,
                last_deep_crawl_time, last_deep_crawl_attempt,
                last_deep_crawl_result, last_deep_crawl_result_msg_id,
                last_deep_crawl_depth,
                last_top_level_poll, last_poll_result, last_poll_attempt,
                average_poll_duration,
                last_pop_poll, last_pop_poll_result,
                last_local_hash_scan, last_local_hash_result,
                average_hash_duration,
                clockss_subscription_status, access_type,
                substance_state, substance_version, metadata_version,
                last_metadata_index, last_content_change,
                num_agree_peers_last_por, num_willing_repairers,
                num_currently_suspect_versions
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27, $28, $29, $30
            )
            ON CONFLICT (au_id) DO UPDATE SET
                au_creation_time = EXCLUDED.au_creation_time,
                last_crawl_time = EXCLUDED.last_crawl_time,
                last_crawl_attempt = EXCLUDED.last_crawl_attempt,
                last_crawl_result = EXCLUDED.last_crawl_result,
                last_crawl_result_msg_id = EXCLUDED.last_crawl_result_msg_id,
                last_deep_crawl_time = EXCLUDED.last_deep_crawl_time,
                last_deep_crawl_attempt = EXCLUDED.last_deep_crawl_attempt,
                last_deep_crawl_result = EXCLUDED.last_deep_crawl_result,
                last_deep_crawl_result_msg_id = EXCLUDED.last_deep_crawl_result_msg_id,
                last_deep_crawl_depth = EXCLUDED.last_deep_crawl_depth,
                last_top_level_poll = EXCLUDED.last_top_level_poll,
                last_poll_result = EXCLUDED.last_poll_result,
                last_poll_attempt = EXCLUDED.last_poll_attempt,
                average_poll_duration = EXCLUDED.average_poll_duration,
                last_pop_poll = EXCLUDED.last_pop_poll,
                last_pop_poll_result = EXCLUDED.last_pop_poll_result,
                last_local_hash_scan = EXCLUDED.last_local_hash_scan,
                last_local_hash_result = EXCLUDED.last_local_hash_result,
                average_hash_duration = EXCLUDED.average_hash_duration,
                clockss_subscription_status = EXCLUDED.clockss_subscription_status,
                access_type = EXCLUDED.access_type,
                substance_state = EXCLUDED.substance_state,
                substance_version = EXCLUDED.substance_version,
                metadata_version = EXCLUDED.metadata_version,
                last_metadata_index = EXCLUDED.last_metadata_index,
                last_content_change = EXCLUDED.last_content_change,
                num_agree_peers_last_por = EXCLUDED.num_agree_peers_last_por,
                num_willing_repairers = EXCLUDED.num_willing_repairers,
                num_currently_suspect_versions = EXCLUDED.num_currently_suspect_versions
            "#,
        )
        .bind(key)
        .bind(record.au_creation_time)
        .bind(record.last_crawl_time)
        .bind(record.last_crawl_attempt)
        .bind(record.last_crawl_result.as_str())
        .bind(msg_id)
        .bind(record.last_deep_crawl_time)
        .bind(record.last_deep_crawl_attempt)
        .bind(record.last_deep_crawl_result.as_str())
        .bind(deep_msg_id)
        .bind(record.last_deep_crawl_depth)
        .bind(record.last_top_level_poll)
        .bind(record.last_poll_result.as_str())
        .bind(record.last_poll_attempt)
        .bind(record.average_poll_duration)
        .bind(record.last_pop_poll)
        .bind(record.last_pop_poll_result.as_str())
        .bind(record.last_local_hash_scan)
        .bind(record.last_local_hash_result.as_str())
        .bind(record.average_hash_duration)
        .bind(record.clockss_subscription_status.as_str())
        .bind(record.access_type.map(|a| a.as_str()))
        .bind(record.substance_state.as_str())
        .bind(record.substance_version.as_deref())
        .bind(record.metadata_version.as_deref())
        .bind(record.last_metadata_index)
        .bind(record.last_content_change)
        .bind(record.num_agree_peers_last_por)
        .bind(record.num_willing_repairers)
        .bind(record.num_currently_suspect_versions)
        .execute(&mut *tx)
        .await?;

        if changed.contains(fields::CDN_STEMS) {
            sqlx::query("DELETE FROM au_cdn_stems WHERE au_id = $1")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            for (ord, stem) in record.cdn_stems.iter().enumerate() {
                let id = stem_id(&mut tx, stem).await?;
                sqlx::query(
                    "INSERT INTO au_cdn_stems (au_id, stem_id, ord) VALUES ($1, $2, $3)",
                )
                .bind(key)
                .bind(id)
                .bind(ord as i32)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(format!("au_states:{key}"))
    }
}

/// Postgres adapter for `AuSuspectUrlVersionsBean`: one row per flagged
/// (au_id, url, version).
pub struct PgSuspectVersionStore {
    pool: PgPool,
}

impl PgSuspectVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SuspectRow {
    url: String,
    version: i32,
    created_time: i64,
    computed_hash: Option<String>,
    stored_hash: Option<String>,
}

#[async_trait]
impl StateStore<AuSuspectUrlVersionsBean> for PgSuspectVersionStore {
    async fn find(&self, key: &str) -> Result<Option<AuSuspectUrlVersionsBean>> {
        // Presence of the AU in au_states distinguishes "empty set" from
        // "never stored".
        let known: Option<String> =
            sqlx::query_scalar("SELECT au_id FROM au_states WHERE au_id = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        let rows: Vec<SuspectRow> = sqlx::query_as(
            r#"
            SELECT url, version, created_time, computed_hash, stored_hash
            FROM au_suspect_url_versions
            WHERE au_id = $1
            ORDER BY created_time, url, version
            "#,
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;

        if known.is_none() && rows.is_empty() {
            return Ok(None);
        }

        Ok(Some(AuSuspectUrlVersionsBean {
            au_id: key.to_string(),
            suspect_versions: rows
                .into_iter()
                .map(|row| SuspectUrlVersion {
                    url: row.url,
                    version: row.version,
                    created_time: row.created_time,
                    computed_hash: row.computed_hash,
                    stored_hash: row.stored_hash,
                })
                .collect(),
        }))
    }

    async fn update(
        &self,
        key: &str,
        record: &AuSuspectUrlVersionsBean,
        _changed: &FieldSet,
    ) -> Result<String> {
        // The set is small and keyed by (url, version); replace it whole.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM au_suspect_url_versions WHERE au_id = $1")
            .bind(key)
            .execute(&mut *tx)
            .await?;
        for entry in &record.suspect_versions {
            sqlx::query(
                r#"
                INSERT INTO au_suspect_url_versions
                    (au_id, url, version, created_time, computed_hash, stored_hash)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(key)
            .bind(&entry.url)
            .bind(entry.version)
            .bind(entry.created_time)
            .bind(entry.computed_hash.as_deref())
            .bind(entry.stored_hash.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(format!("au_suspect_url_versions:{key}"))
    }
}
