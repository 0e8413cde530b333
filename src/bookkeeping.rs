//! Bookkeeping (C6, §4.6 "Prep"/"Visit enumeration"): keeps
//! `message_processed` caught up with the warehouse and enumerates the
//! visit_ids a run needs to touch.

use chrono::{NaiveDate, NaiveDateTime};
use sqlx::PgPool;
use tracing::info;

use crate::error::ManagerError;

const PREP_CHUNK: i64 = 500;
const WHOLE_DB_CHUNK: i64 = 10_000;
const SINGLE_DAY_CHUNK: i64 = 1_000;

/// Backfill `message_processed` with every warehouse message newer
/// than the highest `msh_id` already known, `PREP_CHUNK` rows at a
/// time (§4.6 "Prep").
pub async fn prep_deduplicate_tables(warehouse: &PgPool, mart: &PgPool) -> Result<u64, ManagerError> {
    let max_id: Option<i64> = sqlx::query_scalar("SELECT max(hl7_msh_id) FROM message_processed")
        .fetch_one(mart)
        .await?;
    let mut cursor = max_id.unwrap_or(0);
    let mut total = 0u64;

    loop {
        let rows: Vec<(i64, NaiveDateTime, String)> = sqlx::query_as(
            "SELECT m.hl7_msh_id, m.message_datetime, v.visit_id \
             FROM hl7_msh m JOIN hl7_visit v ON v.hl7_msh_id = m.hl7_msh_id \
             WHERE m.hl7_msh_id > $1 ORDER BY m.hl7_msh_id LIMIT $2",
        )
        .bind(cursor)
        .bind(PREP_CHUNK)
        .fetch_all(warehouse)
        .await?;

        if rows.is_empty() {
            break;
        }

        let mut tx = mart.begin().await?;
        for (msh_id, message_datetime, visit_id) in &rows {
            sqlx::query(
                "INSERT INTO message_processed (hl7_msh_id, message_datetime, visit_id, processed_datetime) \
                 VALUES ($1, $2, $3, NULL) ON CONFLICT (hl7_msh_id) DO NOTHING",
            )
            .bind(msh_id)
            .bind(message_datetime)
            .bind(visit_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        cursor = rows.last().map(|(id, ..)| *id).unwrap_or(cursor);
        total += rows.len() as u64;
        info!(cursor, chunk = rows.len(), "bookkeeping prep chunk inserted");
    }

    Ok(total)
}

/// All distinct `visit_id`s with at least one unprocessed message,
/// restricted to a single `admit_datetime` day when `date` is given
/// (§4.6 "Visit enumeration").
pub async fn visits_to_process(warehouse: &PgPool, mart: &PgPool, date: Option<NaiveDate>) -> Result<Vec<String>, ManagerError> {
    match date {
        Some(day) => visits_for_day(warehouse, mart, day).await,
        None => visits_whole_database(mart).await,
    }
}

async fn visits_whole_database(mart: &PgPool) -> Result<Vec<String>, ManagerError> {
    let mut visits = Vec::new();
    let mut offset = 0i64;
    loop {
        let chunk: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT visit_id FROM message_processed WHERE processed_datetime IS NULL \
             ORDER BY visit_id LIMIT $1 OFFSET $2",
        )
        .bind(WHOLE_DB_CHUNK)
        .bind(offset)
        .fetch_all(mart)
        .await?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as i64;
        visits.extend(chunk);
    }
    Ok(visits)
}

async fn visits_for_day(warehouse: &PgPool, mart: &PgPool, day: NaiveDate) -> Result<Vec<String>, ManagerError> {
    let start = day.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    let end = (day + chrono::Duration::days(1)).and_hms_opt(0, 0, 0).expect("midnight is always valid");

    let mut candidates = Vec::new();
    let mut offset = 0i64;
    loop {
        let chunk: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT v.visit_id FROM hl7_visit v \
             WHERE v.admit_datetime >= $1 AND v.admit_datetime < $2 \
             ORDER BY v.visit_id LIMIT $3 OFFSET $4",
        )
        .bind(start)
        .bind(end)
        .bind(SINGLE_DAY_CHUNK)
        .bind(offset)
        .fetch_all(warehouse)
        .await?;
        if chunk.is_empty() {
            break;
        }
        offset += chunk.len() as i64;
        candidates.extend(chunk);
    }

    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let unprocessed: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT visit_id FROM message_processed \
         WHERE processed_datetime IS NULL AND visit_id = ANY($1)",
    )
    .bind(&candidates)
    .fetch_all(mart)
    .await?;

    Ok(unprocessed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_sizes_match_manager_behavior() {
        assert_eq!(PREP_CHUNK, 500);
        assert_eq!(WHOLE_DB_CHUNK, 10_000);
        assert_eq!(SINGLE_DAY_CHUNK, 1_000);
    }
}
