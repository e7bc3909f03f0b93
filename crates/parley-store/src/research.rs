// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Research job, section and source operations.
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Row};
use uuid::Uuid;

use crate::{JobStatus, ResearchJob, ResearchSection, Result, SourceRef, Store, StoreError};

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Fatal(format!("bad timestamp '{s}': {e}")))
}

const JOB_COLUMNS: &str = "id, user_id, topic, depth, status, progress_percent, plan_outline, \
                           word_count, final_artifact, error, created_at, updated_at";

struct JobRow {
    id: String,
    user_id: String,
    topic: String,
    depth: String,
    status: String,
    progress_percent: i64,
    plan_outline: Option<String>,
    word_count: Option<i64>,
    final_artifact: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        topic: row.get(2)?,
        depth: row.get(3)?,
        status: row.get(4)?,
        progress_percent: row.get(5)?,
        plan_outline: row.get(6)?,
        word_count: row.get(7)?,
        final_artifact: row.get(8)?,
        error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn build_job(r: JobRow) -> Result<ResearchJob> {
    Ok(ResearchJob {
        id: Uuid::parse_str(&r.id).map_err(|e| StoreError::Fatal(e.to_string()))?,
        user_id: r.user_id,
        topic: r.topic,
        depth: r.depth,
        status: JobStatus::parse(&r.status)
            .ok_or_else(|| StoreError::Fatal(format!("bad status '{}'", r.status)))?,
        progress_percent: r.progress_percent,
        plan_outline: r.plan_outline,
        word_count: r.word_count,
        final_artifact: r.final_artifact,
        error: r.error,
        created_at: parse_ts(&r.created_at)?,
        updated_at: parse_ts(&r.updated_at)?,
    })
}

impl Store {
    pub async fn create_research_job(
        &self,
        user_id: &str,
        topic: &str,
        depth: &str,
    ) -> Result<ResearchJob> {
        Self::require_scope(user_id)?;
        let now = Utc::now();
        let job = ResearchJob {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            topic: topic.to_string(),
            depth: depth.to_string(),
            status: JobStatus::Pending,
            progress_percent: 0,
            plan_outline: None,
            word_count: None,
            final_artifact: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO research_jobs (id, user_id, topic, depth, status, progress_percent,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?5)",
            params![job.id.to_string(), user_id, topic, depth, ts(now)],
        )?;
        Ok(job)
    }

    pub async fn get_research_job(&self, user_id: &str, id: Uuid) -> Result<ResearchJob> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let raw = conn.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM research_jobs WHERE id = ?1 AND user_id = ?2"),
            params![id.to_string(), user_id],
            job_from_row,
        )?;
        build_job(raw)
    }

    /// Transition a job's status. Status is monotone (`pending → running →
    /// complete/failed`); a backwards transition is a conflict.
    pub async fn set_job_status(
        &self,
        user_id: &str,
        id: Uuid,
        status: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let current: String = tx.query_row(
            "SELECT status FROM research_jobs WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id],
            |row| row.get(0),
        )?;
        let current = JobStatus::parse(&current)
            .ok_or_else(|| StoreError::Fatal(format!("bad status '{current}'")))?;
        if status.rank() < current.rank() {
            return Err(StoreError::Conflict(format!(
                "job status cannot move {} -> {}",
                current.as_str(),
                status.as_str()
            )));
        }
        tx.execute(
            "UPDATE research_jobs SET status = ?3, error = ?4, updated_at = ?5
             WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id, status.as_str(), error, ts(Utc::now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub async fn set_job_progress(&self, user_id: &str, id: Uuid, percent: i64) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE research_jobs
             SET progress_percent = MAX(progress_percent, ?3), updated_at = ?4
             WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id, percent.clamp(0, 100), ts(Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub async fn set_job_outline(&self, user_id: &str, id: Uuid, outline: &str) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE research_jobs SET plan_outline = ?3, updated_at = ?4
             WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id, outline, ts(Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Record the final artifact and word count on completion.
    pub async fn finish_job_artifact(
        &self,
        user_id: &str,
        id: Uuid,
        artifact: &str,
        word_count: i64,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let n = conn.execute(
            "UPDATE research_jobs SET final_artifact = ?3, word_count = ?4, updated_at = ?5
             WHERE id = ?1 AND user_id = ?2",
            params![id.to_string(), user_id, artifact, word_count, ts(Utc::now())],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Sections stream to storage as they complete; the coordinator never
    /// holds the whole report in memory.
    pub async fn append_job_section(
        &self,
        user_id: &str,
        job_id: Uuid,
        ordinal: i64,
        heading: &str,
        content: &str,
    ) -> Result<()> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let owned: i64 = conn.query_row(
            "SELECT COUNT(*) FROM research_jobs WHERE id = ?1 AND user_id = ?2",
            params![job_id.to_string(), user_id],
            |row| row.get(0),
        )?;
        if owned == 0 {
            return Err(StoreError::NotFound);
        }
        conn.execute(
            "INSERT INTO research_sections (job_id, ordinal, heading, content)
             VALUES (?1, ?2, ?3, ?4)",
            params![job_id.to_string(), ordinal, heading, content],
        )?;
        Ok(())
    }

    pub async fn job_sections(&self, user_id: &str, job_id: Uuid) -> Result<Vec<ResearchSection>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT s.job_id, s.ordinal, s.heading, s.content
             FROM research_sections s
             JOIN research_jobs j ON j.id = s.job_id
             WHERE s.job_id = ?1 AND j.user_id = ?2
             ORDER BY s.ordinal",
        )?;
        let rows = stmt.query_map(params![job_id.to_string(), user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (job, ordinal, heading, content) = raw?;
            out.push(ResearchSection {
                job_id: Uuid::parse_str(&job).map_err(|e| StoreError::Fatal(e.to_string()))?,
                ordinal,
                heading,
                content,
            });
        }
        Ok(out)
    }

    /// Attach a source reference to a job or a message (exactly one referrer).
    pub async fn append_source(&self, user_id: &str, source: &SourceRef) -> Result<()> {
        Self::require_scope(user_id)?;
        if source.job_id.is_some() == source.message_id.is_some() {
            return Err(StoreError::Fatal(
                "a source references exactly one of job or message".into(),
            ));
        }
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO sources (id, user_id, job_id, message_id, url, title, snippet,
                                  credibility_score, publisher_tag, retrieved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                source.id.to_string(),
                user_id,
                source.job_id.map(|j| j.to_string()),
                source.message_id.map(|m| m.to_string()),
                source.url,
                source.title,
                source.snippet,
                source.credibility_score,
                source.publisher_tag,
                ts(source.retrieved_at),
            ],
        )?;
        Ok(())
    }

    pub async fn job_sources(&self, user_id: &str, job_id: Uuid) -> Result<Vec<SourceRef>> {
        Self::require_scope(user_id)?;
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, job_id, message_id, url, title, snippet, credibility_score,
                    publisher_tag, retrieved_at
             FROM sources WHERE job_id = ?1 AND user_id = ?2
             ORDER BY credibility_score DESC, url",
        )?;
        let rows = stmt.query_map(params![job_id.to_string(), user_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;
        let mut out = Vec::new();
        for raw in rows {
            let (id, job, message, url, title, snippet, score, publisher, retrieved) = raw?;
            out.push(SourceRef {
                id: Uuid::parse_str(&id).map_err(|e| StoreError::Fatal(e.to_string()))?,
                user_id: user_id.to_string(),
                job_id: job
                    .map(|j| Uuid::parse_str(&j))
                    .transpose()
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                message_id: message
                    .map(|m| Uuid::parse_str(&m))
                    .transpose()
                    .map_err(|e| StoreError::Fatal(e.to_string()))?,
                url,
                title,
                snippet,
                credibility_score: score,
                publisher_tag: publisher,
                retrieved_at: parse_ts(&retrieved)?,
            });
        }
        Ok(out)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
