// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The research coordinator: job lifecycle, provider fan-out, progressive
//! drafting, citation resolution, and final ingestion.
//!
//! Cancellation is cooperative at subtopic boundaries: the coordinator
//! checks the token (and the depth budget) before each section draft and
//! fails the job in place, keeping everything collected so far readable.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use parley_config::ResearchDepth;
use parley_model::{ChatMessage, CompletionRequest, Metering, ModelGateway};
use parley_retrieval::Ingestor;
use parley_store::{JobStatus, SourceRef, Store};

use crate::{
    credibility,
    provider::{SearchProvider, SourceHit},
    ResearchError,
};

/// Reference list style requested by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationStyle {
    Apa,
    Mla,
    Chicago,
}

impl CitationStyle {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "mla" => Self::Mla,
            "chicago" => Self::Chicago,
            _ => Self::Apa,
        }
    }

    fn format(self, source: &SourceRef) -> String {
        let title = source.title.as_deref().unwrap_or("Untitled");
        let url = &source.url;
        let publisher = &source.publisher_tag;
        let year = source.retrieved_at.format("%Y");
        match self {
            Self::Apa => format!("{title}. ({year}). {publisher}. {url}"),
            Self::Mla => format!("\"{title}.\" {publisher}, {year}, {url}."),
            Self::Chicago => format!("{title}. {publisher}, {year}. {url}."),
        }
    }
}

/// Progress events forwarded onto the session as `progress` frames.
#[derive(Debug, Clone)]
pub enum ResearchEvent {
    Progress { percent: i64, note: String },
    Warning(String),
}

/// What a finished (or failed) run produced, including everything that must
/// be billed.
#[derive(Debug)]
pub struct ResearchOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub meterings: Vec<Metering>,
}

pub struct ResearchCoordinator {
    store: Store,
    gateway: Arc<ModelGateway>,
    providers: Vec<Arc<dyn SearchProvider>>,
    ingestor: Arc<Ingestor>,
    /// Per-provider search timeout.
    provider_timeout: Duration,
}

impl ResearchCoordinator {
    pub fn new(
        store: Store,
        gateway: Arc<ModelGateway>,
        providers: Vec<Arc<dyn SearchProvider>>,
        ingestor: Arc<Ingestor>,
    ) -> Self {
        Self {
            store,
            gateway,
            providers,
            ingestor,
            provider_timeout: Duration::from_secs(15),
        }
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.is_empty()
    }

    /// Run one research job to completion, failure, or cancellation.
    ///
    /// Returns `Err` only when the job record itself cannot be created;
    /// every later failure is captured on the job and reported in the
    /// outcome so partial work stays readable.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        user_id: &str,
        topic: &str,
        depth: ResearchDepth,
        style: CitationStyle,
        model_tag: &str,
        events: mpsc::Sender<ResearchEvent>,
        cancel: CancellationToken,
    ) -> Result<ResearchOutcome, ResearchError> {
        if self.providers.is_empty() {
            return Err(ResearchError::NoProviders);
        }
        let depth_tag = match depth {
            ResearchDepth::Quick => "quick",
            ResearchDepth::Standard => "standard",
            ResearchDepth::Deep => "deep",
        };
        let job = self.store.create_research_job(user_id, topic, depth_tag).await?;
        self.store.set_job_status(user_id, job.id, JobStatus::Running, None).await?;
        let deadline = Instant::now() + depth.budget();
        let mut meterings = Vec::new();

        // ── Plan ──────────────────────────────────────────────────────────────
        let _ = events
            .send(ResearchEvent::Progress { percent: 2, note: "planning subtopics".into() })
            .await;
        let subtopics = match self.plan(topic, depth, model_tag, &mut meterings).await {
            Ok(s) => s,
            Err(e) => {
                warn!(user = %user_id, job = %job.id, error = %e, "planning failed");
                return self.fail(user_id, job.id, "planning failed", meterings).await;
            }
        };
        self.store.set_job_outline(user_id, job.id, &subtopics.join("\n")).await?;
        self.store.set_job_progress(user_id, job.id, 5).await?;

        // ── Fan out across providers ──────────────────────────────────────────
        let per_provider = subtopics.len() * 2;
        let searches = self.providers.iter().map(|p| {
            let provider = Arc::clone(p);
            let topic = topic.to_string();
            async move {
                let result = tokio::time::timeout(
                    self.provider_timeout,
                    provider.search(&topic, per_provider),
                )
                .await;
                (provider.name().to_string(), result)
            }
        });
        let mut hits: Vec<SourceHit> = Vec::new();
        let mut successes = 0usize;
        for (name, result) in futures::future::join_all(searches).await {
            match result {
                Ok(Ok(batch)) => {
                    successes += 1;
                    hits.extend(batch);
                }
                Ok(Err(e)) => {
                    warn!(provider = %name, error = %e, "search provider failed");
                    let _ = events
                        .send(ResearchEvent::Warning(format!("provider {name} failed")))
                        .await;
                }
                Err(_) => {
                    warn!(provider = %name, "search provider timed out");
                    let _ = events
                        .send(ResearchEvent::Warning(format!("provider {name} timed out")))
                        .await;
                }
            }
        }
        if successes == 0 {
            return self.fail(user_id, job.id, "all search providers failed", meterings).await;
        }

        // Dedup by origin+path, score, keep the best.
        let sources = self.select_sources(user_id, job.id, hits, subtopics.len() * 3).await?;
        self.store.set_job_progress(user_id, job.id, 10).await?;
        let _ = events
            .send(ResearchEvent::Progress {
                percent: 10,
                note: format!("{} sources selected", sources.len()),
            })
            .await;

        // ── Draft sections, streaming progress ────────────────────────────────
        let total = subtopics.len();
        for (i, subtopic) in subtopics.iter().enumerate() {
            if cancel.is_cancelled() {
                return self.fail(user_id, job.id, "cancelled", meterings).await;
            }
            if Instant::now() >= deadline {
                return self.fail(user_id, job.id, "time budget exhausted", meterings).await;
            }
            match self.draft_section(topic, subtopic, &sources, model_tag).await {
                Ok((text, metering)) => {
                    meterings.push(metering);
                    self.store
                        .append_job_section(user_id, job.id, i as i64, subtopic, &text)
                        .await?;
                }
                Err(e) => {
                    warn!(job = %job.id, subtopic = %subtopic, error = %e, "section draft failed");
                    return self.fail(user_id, job.id, "drafting failed", meterings).await;
                }
            }
            let percent = 10 + (80 * (i as i64 + 1)) / total as i64;
            self.store.set_job_progress(user_id, job.id, percent).await?;
            let _ = events
                .send(ResearchEvent::Progress {
                    percent,
                    note: format!("section {}/{total} complete", i + 1),
                })
                .await;
        }

        // ── Assemble, resolve citations, ingest ───────────────────────────────
        let sections = self.store.job_sections(user_id, job.id).await?;
        let mut body = format!("# {topic}\n\n");
        for s in &sections {
            body.push_str(&format!("## {}\n\n{}\n\n", s.heading, s.content));
        }
        let body = resolve_placeholders(&body, &sources);
        let references = build_references(&sources, style);
        let artifact = format!("{body}\n## References\n\n{references}");
        let word_count = artifact.split_whitespace().count() as i64;

        self.store.finish_job_artifact(user_id, job.id, &artifact, word_count).await?;
        self.store.set_job_status(user_id, job.id, JobStatus::Complete, None).await?;
        self.store.set_job_progress(user_id, job.id, 100).await?;
        let _ = events
            .send(ResearchEvent::Progress { percent: 100, note: "report complete".into() })
            .await;

        // The finished report becomes part of the user's corpus.
        match self
            .ingestor
            .ingest_text(user_id, &format!("Research Report: {topic}.md"), &artifact)
            .await
        {
            Ok(out) => meterings.extend(out.meterings),
            Err(e) => warn!(job = %job.id, error = %e, "report ingestion failed"),
        }

        info!(user = %user_id, job = %job.id, words = word_count, "research job complete");
        Ok(ResearchOutcome { job_id: job.id, status: JobStatus::Complete, meterings })
    }

    async fn fail(
        &self,
        user_id: &str,
        job_id: Uuid,
        reason: &str,
        meterings: Vec<Metering>,
    ) -> Result<ResearchOutcome, ResearchError> {
        self.store.set_job_status(user_id, job_id, JobStatus::Failed, Some(reason)).await?;
        Ok(ResearchOutcome { job_id, status: JobStatus::Failed, meterings })
    }

    async fn plan(
        &self,
        topic: &str,
        depth: ResearchDepth,
        model_tag: &str,
        meterings: &mut Vec<Metering>,
    ) -> Result<Vec<String>, ResearchError> {
        let n = depth.subtopics();
        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You plan research reports. Reply with one subtopic per line, no \
                     numbering, no commentary.",
                ),
                ChatMessage::user(format!("Break this topic into {n} subtopics: {topic}")),
            ],
            ..Default::default()
        };
        let out = self
            .gateway
            .chat(model_tag, req)
            .await
            .map_err(|e| ResearchError::Model(e.to_string()))?;
        meterings.push(out.metering);
        let mut subtopics: Vec<String> = out
            .text
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*', '•']).trim())
            .map(|l| l.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')').trim())
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();
        subtopics.truncate(n);
        if subtopics.is_empty() {
            subtopics.push(topic.to_string());
        }
        Ok(subtopics)
    }

    async fn select_sources(
        &self,
        user_id: &str,
        job_id: Uuid,
        hits: Vec<SourceHit>,
        keep: usize,
    ) -> Result<Vec<SourceRef>, ResearchError> {
        let year = credibility::current_year();
        let mut best: HashMap<String, (SourceHit, i64)> = HashMap::new();
        for hit in hits {
            let key = credibility::dedup_key(&hit.url);
            let score = credibility::score(&hit, year);
            match best.get(&key) {
                Some((_, existing)) if *existing >= score => {}
                _ => {
                    best.insert(key, (hit, score));
                }
            }
        }
        let mut scored: Vec<(SourceHit, i64)> = best.into_values().collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.url.cmp(&b.0.url)));
        scored.truncate(keep);

        let mut sources = Vec::new();
        for (hit, score) in scored {
            let source = SourceRef {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                job_id: Some(job_id),
                message_id: None,
                publisher_tag: credibility::publisher_tag(&hit.url),
                url: hit.url,
                title: hit.title,
                snippet: hit.snippet,
                credibility_score: score,
                retrieved_at: chrono::Utc::now(),
            };
            self.store.append_source(user_id, &source).await?;
            sources.push(source);
        }
        Ok(sources)
    }

    async fn draft_section(
        &self,
        topic: &str,
        subtopic: &str,
        sources: &[SourceRef],
        model_tag: &str,
    ) -> Result<(String, Metering), ResearchError> {
        let source_block: String = sources
            .iter()
            .map(|s| {
                format!(
                    "- {} — {} ({})",
                    s.title.as_deref().unwrap_or("Untitled"),
                    s.url,
                    s.snippet.as_deref().unwrap_or("no snippet")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "You write one section of a research report. Ground every claim in the \
                     provided sources and cite them inline as [Author Year] placeholders.",
                ),
                ChatMessage::user(format!(
                    "Report topic: {topic}\nSection: {subtopic}\n\nSources:\n{source_block}"
                )),
            ],
            ..Default::default()
        };
        let out = self
            .gateway
            .chat(model_tag, req)
            .await
            .map_err(|e| ResearchError::Model(e.to_string()))?;
        Ok((out.text.trim().to_string(), out.metering))
    }
}

/// Resolve `[Author Year]` placeholders against the collected sources.
/// Placeholders matching no source lose their brackets; matched ones stay
/// inline in author–year form.
fn resolve_placeholders(text: &str, sources: &[SourceRef]) -> String {
    let re = Regex::new(r"\[([A-Za-z][^\[\]]{0,80}?\s\d{4})\]").unwrap();
    re.replace_all(text, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        if matches_any_source(inner, sources) {
            format!("[{inner}]")
        } else {
            inner.to_string()
        }
    })
    .into_owned()
}

fn matches_any_source(placeholder: &str, sources: &[SourceRef]) -> bool {
    let tokens: Vec<String> = placeholder
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|t| t.chars().any(|c| c.is_alphabetic()))
        .collect();
    sources.iter().any(|s| {
        let haystack = format!(
            "{} {}",
            s.title.as_deref().unwrap_or("").to_lowercase(),
            s.publisher_tag.to_lowercase()
        );
        tokens.iter().any(|t| haystack.contains(t.as_str()))
    })
}

fn build_references(sources: &[SourceRef], style: CitationStyle) -> String {
    let mut entries: Vec<String> = sources.iter().map(|s| style.format(s)).collect();
    entries.sort();
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| format!("{}. {e}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
