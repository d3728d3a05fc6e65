use std::time::Duration;

use async_trait::async_trait;
use evcat_core::{CanonicalEvent, ProvenanceKey, ReviewFlag};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{
    merge_for_upsert, CandidateWindow, PersistenceError, PersistenceGateway, UpsertOutcome,
};

/// Postgres-backed catalog. Events are stored as JSONB payloads with the columns
/// needed for candidate lookups pulled out alongside.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| PersistenceError::Unavailable(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn decode_events(rows: Vec<sqlx::postgres::PgRow>) -> Result<Vec<CanonicalEvent>, PersistenceError> {
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let Json(event): Json<CanonicalEvent> = row.try_get("payload")?;
        out.push(event);
    }
    Ok(out)
}

#[async_trait]
impl PersistenceGateway for PgGateway {
    async fn upsert(&self, event: &CanonicalEvent) -> Result<UpsertOutcome, PersistenceError> {
        let id = event.canonical_id;
        let mut tx = self.pool.begin().await?;

        let stored = sqlx::query(
            r#"
            SELECT payload
              FROM canonical_events
             WHERE canonical_id = $1
               FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| row.try_get::<Json<CanonicalEvent>, _>("payload"))
        .transpose()?
        .map(|Json(event)| event);

        let merged = merge_for_upsert(stored.as_ref(), event);
        for key in merged.sources.keys() {
            let owner: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT canonical_id
                  FROM event_sources
                 WHERE platform = $1 AND url = $2
                "#,
            )
            .bind(&key.platform)
            .bind(&key.url)
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(owner) = owner.filter(|owner| *owner != id) {
                return Err(PersistenceError::Conflict { key, owner });
            }
        }

        sqlx::query(
            r#"
            INSERT INTO canonical_events (canonical_id, city_key, start_time, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (canonical_id) DO UPDATE
               SET city_key = EXCLUDED.city_key,
                   start_time = EXCLUDED.start_time,
                   payload = EXCLUDED.payload,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(id)
        .bind(merged.location().city_key())
        .bind(merged.start())
        .bind(Json(&merged))
        .bind(merged.created_at)
        .bind(merged.updated_at)
        .execute(&mut *tx)
        .await?;

        for provenance in merged.sources.iter() {
            let key = provenance.key();
            sqlx::query(
                r#"
                INSERT INTO event_sources (platform, url, canonical_id, scraped_at, source_id)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (platform, url) DO NOTHING
                "#,
            )
            .bind(&key.platform)
            .bind(&key.url)
            .bind(id)
            .bind(provenance.scraped_at)
            .bind(provenance.source_id.as_deref())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(UpsertOutcome {
            canonical_id: id,
            created: stored.is_none(),
        })
    }

    async fn candidates(
        &self,
        window: &CandidateWindow,
    ) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT payload
              FROM canonical_events
             WHERE city_key = $1
               AND start_time BETWEEN $2 AND $3
             ORDER BY canonical_id
            "#,
        )
        .bind(&window.city_key)
        .bind(window.from)
        .bind(window.to)
        .fetch_all(&self.pool)
        .await?;
        decode_events(rows)
    }

    async fn owners(&self, keys: &[ProvenanceKey]) -> Result<Vec<CanonicalEvent>, PersistenceError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let platforms = keys.iter().map(|k| k.platform.clone()).collect::<Vec<_>>();
        let urls = keys.iter().map(|k| k.url.clone()).collect::<Vec<_>>();
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ce.canonical_id, ce.payload
              FROM canonical_events ce
              JOIN event_sources es ON es.canonical_id = ce.canonical_id
              JOIN UNNEST($1::text[], $2::text[]) AS k(platform, url)
                ON k.platform = es.platform AND k.url = es.url
             ORDER BY ce.canonical_id
            "#,
        )
        .bind(&platforms)
        .bind(&urls)
        .fetch_all(&self.pool)
        .await?;
        decode_events(rows)
    }

    async fn flag_for_review(&self, flag: &ReviewFlag) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            INSERT INTO review_flags (canonical_id, candidate_id, score, flagged_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (canonical_id, candidate_id) DO UPDATE
               SET score = EXCLUDED.score
            "#,
        )
        .bind(flag.canonical_id)
        .bind(flag.candidate_id)
        .bind(flag.score)
        .bind(flag.flagged_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
