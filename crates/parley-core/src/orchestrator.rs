// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The orchestrator: per-turn plan decision, sub-agent execution, prompt
//! composition, response streaming, and failure conversion.
//!
//! Failure semantics at this boundary:
//! - retrieval failure → continue without retrieval, logged;
//! - tabular failure → user-visible error frame, then a direct answer from
//!   the question alone;
//! - model failure after retries → error frame, turn aborted, no partial
//!   assistant message persisted;
//! - budget denial → a single dedicated frame, the turn never starts.
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use parley_config::{DisciplineLevel, ResearchDepth};
use parley_model::{
    ChatMessage, CompletionRequest, ModelGateway, ResponseEvent, Usage,
};
use parley_research::{CitationStyle, ResearchCoordinator, ResearchEvent};
use parley_retrieval::{package_citations, Citation, HybridSearcher};
use parley_store::{MessageRole, NewMessage, Store, StoreError};
use parley_tabular::{TabularError, TabularPlanner};

use crate::{
    budget::{Admission, BudgetGovernor},
    context::temporal_block,
    conversation::{derive_title, HISTORY_WINDOW},
    events::{ErrorCode, ToolResultKind, TurnEvent, TurnStats},
    intent::{classify, Plan, PlanInputs},
    memory::{memory_block, MemoryRecall},
    prompts::{build_system_prompt, retrieved_context_block, PromptInputs},
};

/// Orchestrator-level branch deadlines.
const DIRECT_DEADLINE: Duration = Duration::from_secs(60);
const RETRIEVAL_DEADLINE: Duration = Duration::from_secs(10);
const TABULAR_DEADLINE: Duration = Duration::from_secs(15);

/// Token overhead assumed for system prompt + history in pre-flight
/// estimates, plus the output allowance the estimate charges for.
const ESTIMATE_OVERHEAD_TOKENS: u32 = 1_500;
const ESTIMATE_OUTPUT_TOKENS: u32 = 500;

/// Per-turn options carried in the chat frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnOptions {
    pub rag_only: bool,
    pub model_tag: Option<String>,
    pub discipline: Option<DisciplineLevel>,
    /// Forces the research branch at the given depth.
    pub research_depth: Option<ResearchDepth>,
    pub citation_style: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub user_id: String,
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    pub text: String,
    pub options: TurnOptions,
}

pub struct Orchestrator {
    store: Store,
    gateway: Arc<ModelGateway>,
    searcher: Arc<HybridSearcher>,
    tabular: Arc<TabularPlanner>,
    research: Option<Arc<ResearchCoordinator>>,
    budget: Arc<BudgetGovernor>,
    memory: MemoryRecall,
    default_model_tag: String,
    default_discipline: DisciplineLevel,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        gateway: Arc<ModelGateway>,
        searcher: Arc<HybridSearcher>,
        tabular: Arc<TabularPlanner>,
        research: Option<Arc<ResearchCoordinator>>,
        budget: Arc<BudgetGovernor>,
        default_model_tag: String,
        default_discipline: DisciplineLevel,
    ) -> Self {
        let memory = MemoryRecall::new(store.clone(), Arc::clone(&gateway));
        Self {
            store,
            gateway,
            searcher,
            tabular,
            research,
            budget,
            memory,
            default_model_tag,
            default_discipline,
        }
    }

    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    pub fn memory(&self) -> &MemoryRecall {
        &self.memory
    }

    /// Run one user turn, emitting ordered events through `tx`.
    ///
    /// Every failure is converted into events; an `Err` return means the
    /// caller should emit a generic `internal` error frame.
    pub async fn run_turn(
        &self,
        req: TurnRequest,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let user = req.user_id.as_str();

        let conversation = match self.store.get_conversation(user, req.conversation_id).await {
            Ok(c) => c,
            Err(StoreError::NotFound) => {
                emit(&tx, TurnEvent::Error {
                    code: ErrorCode::NotFound,
                    message: "conversation not found".into(),
                })
                .await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let settings = self.store.get_settings(user).await?;
        let mut model_tag = req
            .options
            .model_tag
            .clone()
            .or(settings.default_model_tag)
            .unwrap_or_else(|| self.default_model_tag.clone());
        if !self.gateway.has_tag(&model_tag) {
            warn!(user, tag = %model_tag, "unknown model tag, using default");
            model_tag = self.default_model_tag.clone();
        }

        // ── Pre-flight admission ──────────────────────────────────────────────
        let est_input =
            self.gateway.count_tokens(&req.text, &model_tag) as u32 + ESTIMATE_OVERHEAD_TOKENS;
        let estimated_cost =
            self.gateway.estimate_cost(&model_tag, est_input, ESTIMATE_OUTPUT_TOKENS);
        match self.budget.admit(user, estimated_cost).await? {
            Admission::Deny { .. } => {
                emit(&tx, TurnEvent::Error {
                    code: ErrorCode::BudgetExceeded,
                    message: "monthly budget exceeded; raise the cap or wait for the new month"
                        .into(),
                })
                .await;
                return Ok(());
            }
            Admission::Warn { percent_used } => {
                let cap = self
                    .store
                    .get_settings(user)
                    .await?
                    .monthly_budget
                    .unwrap_or_default();
                emit(&tx, TurnEvent::BudgetWarning { percent_used, cap_minor: cap }).await;
            }
            Admission::Allow => {}
        }

        // ── Record the user turn ──────────────────────────────────────────────
        self.store
            .append_message(user, req.conversation_id, NewMessage {
                role: MessageRole::User,
                content: req.text.clone(),
                agent_tag: None,
                model_tag: None,
                input_tokens: None,
                output_tokens: None,
                latency_ms: None,
                citations: None,
            })
            .await?;
        if conversation.title.is_none() {
            self.store
                .set_title_if_absent(user, req.conversation_id, &derive_title(&req.text))
                .await?;
        }

        let history = self.store.last_messages(user, req.conversation_id, HISTORY_WINDOW).await?;

        // ── Decide the plan ───────────────────────────────────────────────────
        let documents = self.store.list_documents(user).await?;
        let has_ready_documents =
            documents.iter().any(|d| d.status == parley_store::DocumentStatus::Ready);
        let bindings = self.store.list_bindings(user).await?;
        let active_binding = bindings
            .iter()
            .find(|b| b.status == parley_store::BindingStatus::Active)
            .map(|b| b.id);
        let research_available =
            self.research.as_ref().map(|r| r.has_providers()).unwrap_or(false);
        let last_turn_was_tabular = history
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::Assistant)
            .map(|m| m.agent_tag.as_deref() == Some("tabular"))
            .unwrap_or(false);

        let mut plan = classify(&req.text, PlanInputs {
            has_ready_documents,
            has_active_binding: active_binding.is_some(),
            research_available,
            last_turn_was_tabular,
        });
        if req.options.research_depth.is_some() && research_available {
            plan = Plan { use_research: true, ..Default::default() };
        }

        let agent_tag: &'static str = if plan.use_research {
            "research"
        } else if plan.use_tabular {
            "tabular"
        } else if plan.use_retrieval {
            "retrieval"
        } else {
            "chat"
        };
        emit(&tx, TurnEvent::Started { agent_tag }).await;
        info!(user, turn = %req.turn_id, agent = agent_tag, "turn started");

        // ── Ambient context ───────────────────────────────────────────────────
        let now = chrono::Utc::now();
        let last_message_at = history
            .iter()
            .rev()
            .skip(1) // the turn we just appended
            .map(|m| m.created_at)
            .next();
        let temporal = temporal_block(now, last_message_at, Some(conversation.created_at));

        let mut memory_text = String::new();
        if !req.options.rag_only {
            match self.memory.recall(user, &req.text).await {
                Ok(recall) => {
                    if let Some(m) = recall.metering {
                        let _ = self.budget.record(user, Uuid::new_v4(), &m).await;
                    }
                    memory_text = memory_block(&recall.facts);
                }
                Err(e) => warn!(user, error = %e, "memory recall failed"),
            }
        }

        let inventory: String = documents
            .iter()
            .map(|d| format!("- {} ({})", d.display_name, d.status.as_str()))
            .collect::<Vec<_>>()
            .join("\n");

        // ── Execute the plan ──────────────────────────────────────────────────
        let discipline = req.options.discipline.unwrap_or(self.default_discipline);
        let mut retrieved_context = String::new();
        let mut citations: Vec<Citation> = Vec::new();
        if plan.use_retrieval {
            match tokio::time::timeout(
                RETRIEVAL_DEADLINE,
                self.searcher.search(user, &req.text, discipline),
            )
            .await
            {
                Ok(Ok(outcome)) => {
                    if let Some(m) = outcome.metering {
                        let _ = self.budget.record(user, Uuid::new_v4(), &m).await;
                    }
                    if outcome.results.is_empty() {
                        retrieved_context =
                            "No relevant material was found in the user's documents.".into();
                    } else {
                        citations = package_citations(&outcome.results);
                        retrieved_context = retrieved_context_block(&outcome.results);
                    }
                }
                Ok(Err(e)) => warn!(user, error = %e, "retrieval failed, continuing without"),
                Err(_) => warn!(user, "retrieval deadline exceeded, continuing without"),
            }
        }

        let mut tabular_text = String::new();
        if plan.use_tabular {
            let binding_id = active_binding.expect("plan requires an active binding");
            let context: String = history
                .iter()
                .rev()
                .take(5)
                .map(|m| format!("{}: {}", m.role.as_str(), m.content))
                .collect::<Vec<_>>()
                .join("\n");
            match tokio::time::timeout(
                TABULAR_DEADLINE,
                self.tabular.answer(user, binding_id, &req.text, &context, &model_tag),
            )
            .await
            {
                Ok(Ok(answer)) => {
                    for m in &answer.meterings {
                        let _ = self.budget.record(user, Uuid::new_v4(), m).await;
                    }
                    emit(&tx, TurnEvent::ToolResult {
                        kind: ToolResultKind::Sql,
                        payload: serde_json::json!({
                            "generated_sql": answer.generated_sql,
                            "columns": answer.columns,
                            "rows": answer.rows,
                            "row_count": answer.row_count,
                            "wall_ms": answer.wall_ms,
                        }),
                    })
                    .await;
                    tabular_text = render_table(&answer.columns, &answer.rows, answer.row_count);
                }
                Ok(Err(e)) => {
                    warn!(user, error = %e, "tabular branch failed, direct answer fallback");
                    emit(&tx, TurnEvent::Error {
                        code: tabular_error_code(&e),
                        message: tabular_error_message(&e),
                    })
                    .await;
                }
                Err(_) => {
                    emit(&tx, TurnEvent::Error {
                        code: ErrorCode::TabularExecution,
                        message: "database query timed out".into(),
                    })
                    .await;
                }
            }
        }

        let mut research_context = String::new();
        if plan.use_research {
            if let Some(research) = &self.research {
                research_context = self
                    .run_research_branch(user, &req, research, &model_tag, &tx, &cancel)
                    .await?;
                if cancel.is_cancelled() {
                    emit(&tx, TurnEvent::Ended { stats: TurnStats::default(), cancelled: true })
                        .await;
                    return Ok(());
                }
            }
        }

        // ── Compose and stream ────────────────────────────────────────────────
        let system = build_system_prompt(&PromptInputs {
            temporal_block: temporal,
            document_inventory: inventory,
            memory_block: memory_text,
            rag_only: req.options.rag_only,
            retrieved_context: if research_context.is_empty() {
                retrieved_context
            } else {
                research_context
            },
            tabular_block: tabular_text,
        });
        let mut messages = vec![ChatMessage::system(system)];
        for m in &history {
            match m.role {
                MessageRole::User => messages.push(ChatMessage::user(&m.content)),
                MessageRole::Assistant => messages.push(ChatMessage::assistant(&m.content)),
                MessageRole::System => {}
            }
        }

        let started = std::time::Instant::now();
        let request = CompletionRequest { messages, ..Default::default() };
        let mut stream = match self.gateway.stream_chat(&model_tag, request).await {
            Ok(s) => s,
            Err(e) => {
                error!(user, error = %e, "model gateway failed after retries");
                emit(&tx, TurnEvent::Error {
                    code: ErrorCode::UpstreamUnavailable,
                    message: "the model provider is unavailable; try again shortly".into(),
                })
                .await;
                emit(&tx, TurnEvent::Ended { stats: TurnStats::default(), cancelled: false })
                    .await;
                return Ok(());
            }
        };

        let deadline = tokio::time::Instant::now() + DIRECT_DEADLINE;
        let mut text = String::new();
        let mut usage = Usage::default();
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(user, turn = %req.turn_id, "direct answer deadline exceeded");
                    emit(&tx, TurnEvent::Error {
                        code: ErrorCode::UpstreamUnavailable,
                        message: "response deadline exceeded".into(),
                    }).await;
                    break;
                }
                ev = stream.next() => match ev {
                    Some(Ok(ResponseEvent::TextDelta(delta))) => {
                        if !delta.is_empty() {
                            text.push_str(&delta);
                            emit(&tx, TurnEvent::TextDelta(delta)).await;
                        }
                    }
                    Some(Ok(ResponseEvent::Usage { input_tokens, output_tokens })) => {
                        usage.fold(input_tokens, output_tokens);
                    }
                    Some(Ok(ResponseEvent::Done(_))) | None => break,
                    Some(Ok(ResponseEvent::Error(e))) => {
                        warn!(user, error = %e, "provider reported a mid-stream error");
                        emit(&tx, TurnEvent::Error {
                            code: ErrorCode::UpstreamUnavailable,
                            message: "the model stream ended early".into(),
                        }).await;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(user, error = %e, "stream transport error");
                        emit(&tx, TurnEvent::Error {
                            code: ErrorCode::UpstreamUnavailable,
                            message: "the model stream ended early".into(),
                        }).await;
                        break;
                    }
                }
            }
        }

        // Tokens the provider already produced are billed even on cancel.
        if usage.output_tokens == 0 && !text.is_empty() {
            usage.output_tokens = (text.len() / 4).max(1) as u32;
        }
        let latency_ms = started.elapsed().as_millis() as u64;
        let metering = self.gateway.meter(&model_tag, usage, latency_ms);
        let _ = self.budget.record(user, req.turn_id, &metering).await;

        if !citations.is_empty() && !text.is_empty() {
            emit(&tx, TurnEvent::Citations(citations.clone())).await;
        }

        if !text.is_empty() {
            let citations_json = if citations.is_empty() {
                None
            } else {
                serde_json::to_value(&citations).ok()
            };
            self.store
                .append_message(user, req.conversation_id, NewMessage {
                    role: MessageRole::Assistant,
                    content: text,
                    agent_tag: Some(agent_tag.to_string()),
                    model_tag: Some(model_tag.clone()),
                    input_tokens: Some(usage.input_tokens),
                    output_tokens: Some(usage.output_tokens),
                    latency_ms: Some(latency_ms),
                    citations: citations_json,
                })
                .await?;
        }

        emit(&tx, TurnEvent::Ended {
            stats: TurnStats {
                model_tag,
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                latency_ms,
                cost_minor: metering.cost_minor,
            },
            cancelled,
        })
        .await;
        Ok(())
    }

    /// Run the research branch: forward its progress, bill its meterings,
    /// and return the synthesis context (the report head, or a failure note).
    async fn run_research_branch(
        &self,
        user: &str,
        req: &TurnRequest,
        research: &Arc<ResearchCoordinator>,
        model_tag: &str,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let depth = req.options.research_depth.unwrap_or(ResearchDepth::Standard);
        let style =
            CitationStyle::parse(req.options.citation_style.as_deref().unwrap_or("apa"));

        let (ev_tx, mut ev_rx) = mpsc::channel::<ResearchEvent>(64);
        let forward_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(ev) = ev_rx.recv().await {
                let mapped = match ev {
                    ResearchEvent::Progress { percent, note } => {
                        TurnEvent::Progress { percent, note }
                    }
                    ResearchEvent::Warning(w) => TurnEvent::Progress { percent: -1, note: w },
                };
                if forward_tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });

        let outcome = research
            .run(user, &req.text, depth, style, model_tag, ev_tx, cancel.child_token())
            .await;
        let _ = forwarder.await;

        let outcome = match outcome {
            Ok(o) => o,
            Err(e) => {
                warn!(user, error = %e, "research branch unavailable");
                emit(tx, TurnEvent::Error {
                    code: ErrorCode::UpstreamUnavailable,
                    message: "research is unavailable right now".into(),
                })
                .await;
                return Ok(String::new());
            }
        };
        for m in &outcome.meterings {
            let _ = self.budget.record(user, Uuid::new_v4(), m).await;
        }

        let job = self.store.get_research_job(user, outcome.job_id).await?;
        emit(tx, TurnEvent::ToolResult {
            kind: ToolResultKind::Research,
            payload: serde_json::json!({
                "job_id": job.id,
                "status": job.status,
                "progress_percent": job.progress_percent,
                "word_count": job.word_count,
            }),
        })
        .await;

        Ok(match job.final_artifact {
            Some(artifact) => {
                let head: String = artifact.chars().take(8_000).collect();
                format!("A research report was just produced. Its content:\n\n{head}")
            }
            None => format!(
                "A research job was attempted but ended in state '{}'{}.",
                job.status.as_str(),
                job.error.map(|e| format!(" ({e})")).unwrap_or_default()
            ),
        })
    }
}

async fn emit(tx: &mpsc::Sender<TurnEvent>, ev: TurnEvent) {
    // The session layer owns backpressure; a dropped receiver means the
    // client is gone and the turn's remaining events are moot.
    let _ = tx.send(ev).await;
}

fn tabular_error_code(e: &TabularError) -> ErrorCode {
    match e {
        TabularError::GenerationInvalid(_) | TabularError::ValidationRejected(_) => {
            ErrorCode::TabularUnsafe
        }
        TabularError::ExecutionTimeout
        | TabularError::Execution(_)
        | TabularError::Connection(_) => ErrorCode::TabularExecution,
        TabularError::Provider(_) => ErrorCode::UpstreamUnavailable,
        TabularError::Store(_) => ErrorCode::Internal,
    }
}

fn tabular_error_message(e: &TabularError) -> String {
    match e {
        TabularError::GenerationInvalid(_) | TabularError::ValidationRejected(_) => {
            "a safe query could not be generated for that question".into()
        }
        TabularError::ExecutionTimeout => "database query timed out".into(),
        TabularError::Execution(_) => "database query failed".into(),
        TabularError::Connection(_) => "the database connection failed".into(),
        _ => "the tabular assistant is unavailable".into(),
    }
}

/// Compact textual rendering of query results for the prompt.
fn render_table(columns: &[String], rows: &[Vec<serde_json::Value>], row_count: usize) -> String {
    const SHOWN: usize = 20;
    let mut out = columns.join(" | ");
    out.push('\n');
    for row in rows.iter().take(SHOWN) {
        let line: Vec<String> = row.iter().map(value_to_cell).collect();
        out.push_str(&line.join(" | "));
        out.push('\n');
    }
    if row_count > SHOWN {
        out.push_str(&format!("… {row_count} rows total, showing {SHOWN}\n"));
    }
    out
}

fn value_to_cell(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
