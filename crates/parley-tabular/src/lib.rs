// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! Tabular query planner: natural language → a single validated `SELECT`
//! against a user-attached external database.
//!
//! The planner never trusts generated SQL. Every candidate passes the static
//! validator (single statement, SELECT-only, known tables) before touching
//! the external engine, execution runs on a read-only credential with a
//! statement timeout and an injected row cap, and every attempt lands in the
//! user's query history.

pub mod crypto;
pub mod executor;
pub mod validate;

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use parley_model::{ChatMessage, CompletionRequest, Metering, ModelGateway, ProviderError};
use parley_store::{Binding, BindingStatus, Store, StoreError, TabularHistoryEntry};

pub use crypto::CredentialCrypto;
pub use executor::{
    EngineRegistry, ExternalDatabase, MockDatabase, SchemaSnapshot, TableRows, TableSummary,
};

#[derive(Debug, Error)]
pub enum TabularError {
    /// The model produced no usable SELECT at all.
    #[error("no valid query could be generated: {0}")]
    GenerationInvalid(String),

    /// Static validation rejected the generated statement.
    #[error("generated SQL failed safety validation: {0}")]
    ValidationRejected(String),

    #[error("query execution timed out")]
    ExecutionTimeout,

    #[error("query execution failed: {0}")]
    Execution(String),

    #[error("database connection failed: {0}")]
    Connection(String),

    #[error("model gateway error: {0}")]
    Provider(ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TabularError {
    /// Short code recorded in the history table.
    pub fn history_code(&self) -> &'static str {
        match self {
            Self::GenerationInvalid(_) => "generation_invalid",
            Self::ValidationRejected(_) => "validation_rejected",
            Self::ExecutionTimeout => "execution_timeout",
            Self::Execution(_) => "execution_error",
            Self::Connection(_) => "connection_error",
            Self::Provider(_) => "generation_invalid",
            Self::Store(_) => "execution_error",
        }
    }
}

/// A generated-and-validated statement that has not been executed.
#[derive(Debug, Clone)]
pub struct GeneratedSql {
    pub sql: String,
    pub meterings: Vec<Metering>,
}

/// A full question → rows answer.
#[derive(Debug, Clone)]
pub struct TabularAnswer {
    pub generated_sql: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub row_count: usize,
    pub wall_ms: u64,
    pub meterings: Vec<Metering>,
}

pub struct TabularPlanner {
    store: Store,
    gateway: Arc<ModelGateway>,
    engines: EngineRegistry,
    crypto: CredentialCrypto,
    statement_timeout: Duration,
    row_cap: u64,
}

impl TabularPlanner {
    pub fn new(
        store: Store,
        gateway: Arc<ModelGateway>,
        engines: EngineRegistry,
        crypto: CredentialCrypto,
        statement_timeout: Duration,
        row_cap: u64,
    ) -> Self {
        Self { store, gateway, engines, crypto, statement_timeout, row_cap }
    }

    // ── Binding management ────────────────────────────────────────────────────

    /// Register a binding: encrypt the credential, persist it, then try to
    /// introspect the schema. The plaintext credential exists only on this
    /// stack frame.
    pub async fn register_binding(
        &self,
        user_id: &str,
        display_name: &str,
        engine_tag: &str,
        credential: &str,
    ) -> Result<Binding, TabularError> {
        let blob = self
            .crypto
            .encrypt(credential.as_bytes())
            .map_err(|e| TabularError::Connection(e.to_string()))?;
        let binding = self.store.create_binding(user_id, display_name, engine_tag, &blob).await?;
        self.refresh_binding(user_id, binding.id).await
    }

    /// (Re)validate a binding: introspect and update status + snapshot.
    pub async fn refresh_binding(
        &self,
        user_id: &str,
        binding_id: Uuid,
    ) -> Result<Binding, TabularError> {
        let binding = self.store.get_binding(user_id, binding_id).await?;
        let engine = self.engines.get(&binding.engine_tag)?;
        let credential = self.decrypt_credential(&binding)?;
        match engine.introspect(&credential).await {
            Ok(snapshot) => {
                let value = serde_json::to_value(&snapshot)
                    .map_err(|e| TabularError::Connection(e.to_string()))?;
                self.store
                    .set_binding_status(user_id, binding_id, BindingStatus::Active, Some(&value))
                    .await?;
                info!(user = %user_id, binding = %binding_id, "binding validated");
            }
            Err(e) => {
                warn!(user = %user_id, binding = %binding_id, error = %e, "binding validation failed");
                self.store
                    .set_binding_status(user_id, binding_id, BindingStatus::Failed, None)
                    .await?;
                return Err(e);
            }
        }
        Ok(self.store.get_binding(user_id, binding_id).await?)
    }

    // ── Generation / validation / execution ───────────────────────────────────

    /// Generate a validated SELECT without executing it.
    pub async fn generate(
        &self,
        user_id: &str,
        binding_id: Uuid,
        question: &str,
        context: &str,
        model_tag: &str,
    ) -> Result<GeneratedSql, TabularError> {
        let binding = self.active_binding(user_id, binding_id).await?;
        let snapshot = snapshot_of(&binding)?;
        self.generate_against(&snapshot, question, context, model_tag).await
    }

    /// Validate caller-supplied SQL against a binding's snapshot.
    pub async fn validate(
        &self,
        user_id: &str,
        binding_id: Uuid,
        sql: &str,
    ) -> Result<(), TabularError> {
        let binding = self.active_binding(user_id, binding_id).await?;
        let snapshot = snapshot_of(&binding)?;
        validate::validate_select(sql, &snapshot).map_err(TabularError::ValidationRejected)
    }

    /// Ask the model to explain a statement in plain language.
    pub async fn explain(
        &self,
        user_id: &str,
        binding_id: Uuid,
        sql: &str,
        model_tag: &str,
    ) -> Result<(String, Vec<Metering>), TabularError> {
        let binding = self.active_binding(user_id, binding_id).await?;
        let snapshot = snapshot_of(&binding)?;
        let req = CompletionRequest {
            messages: vec![
                ChatMessage::system(
                    "Explain what the given SQL query computes, in two or three plain \
                     sentences aimed at a non-technical reader.",
                ),
                ChatMessage::user(format!("Schema:\n{}\n\nQuery:\n{sql}", snapshot.prompt_block())),
            ],
            ..Default::default()
        };
        let out = self.gateway.chat(model_tag, req).await.map_err(TabularError::Provider)?;
        Ok((out.text.trim().to_string(), vec![out.metering]))
    }

    /// The full flow: generate, validate (with one feedback retry),
    /// execute bounded, persist history.
    pub async fn answer(
        &self,
        user_id: &str,
        binding_id: Uuid,
        question: &str,
        context: &str,
        model_tag: &str,
    ) -> Result<TabularAnswer, TabularError> {
        let result = self.answer_inner(user_id, binding_id, question, context, model_tag).await;

        // Persist the attempt whatever happened; history failures must not
        // mask the primary outcome.
        let entry = TabularHistoryEntry {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            binding_id,
            question: question.to_string(),
            generated_sql: result.as_ref().ok().map(|a| a.generated_sql.clone()),
            row_count: result.as_ref().ok().map(|a| a.row_count as i64),
            wall_ms: result.as_ref().ok().map(|a| a.wall_ms),
            error: result.as_ref().err().map(|e| e.history_code().to_string()),
            created_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.append_tabular_history(user_id, &entry).await {
            warn!(user = %user_id, error = %e, "failed to persist tabular history");
        }
        result
    }

    async fn answer_inner(
        &self,
        user_id: &str,
        binding_id: Uuid,
        question: &str,
        context: &str,
        model_tag: &str,
    ) -> Result<TabularAnswer, TabularError> {
        let binding = self.active_binding(user_id, binding_id).await?;
        let snapshot = snapshot_of(&binding)?;
        let generated =
            self.generate_against(&snapshot, question, context, model_tag).await?;

        let engine = self.engines.get(&binding.engine_tag)?;
        let credential = self.decrypt_credential(&binding)?;
        let bounded = validate::inject_limit(&generated.sql, self.row_cap);

        let started = Instant::now();
        let rows = tokio::time::timeout(
            // A grace period over the engine-side statement timeout.
            self.statement_timeout + Duration::from_secs(1),
            engine.execute(&credential, &bounded, self.statement_timeout),
        )
        .await
        .map_err(|_| TabularError::ExecutionTimeout)??;
        let wall_ms = started.elapsed().as_millis() as u64;

        Ok(TabularAnswer {
            generated_sql: bounded,
            row_count: rows.rows.len(),
            columns: rows.columns,
            rows: rows.rows,
            wall_ms,
            meterings: generated.meterings,
        })
    }

    async fn generate_against(
        &self,
        snapshot: &SchemaSnapshot,
        question: &str,
        context: &str,
        model_tag: &str,
    ) -> Result<GeneratedSql, TabularError> {
        let mut meterings = Vec::new();
        let mut feedback: Option<String> = None;

        // One regeneration retry, with the validator's reason injected.
        for _ in 0..2 {
            let req = generation_request(snapshot, question, context, feedback.as_deref());
            let out = self.gateway.chat(model_tag, req).await.map_err(TabularError::Provider)?;
            meterings.push(out.metering);

            let Some(sql) = validate::extract_select(&out.text) else {
                feedback = Some("the response contained no SELECT statement".into());
                continue;
            };
            match validate::validate_select(&sql, snapshot) {
                Ok(()) => return Ok(GeneratedSql { sql, meterings }),
                Err(reason) => {
                    warn!(reason = %reason, "generated SQL rejected");
                    feedback = Some(reason);
                }
            }
        }

        let reason = feedback.unwrap_or_else(|| "unknown".into());
        // No SELECT at all is a generation failure; an extracted-but-unsafe
        // statement is a validation failure.
        if reason.contains("no SELECT") {
            Err(TabularError::GenerationInvalid(reason))
        } else {
            Err(TabularError::ValidationRejected(reason))
        }
    }

    async fn active_binding(&self, user_id: &str, binding_id: Uuid) -> Result<Binding, TabularError> {
        let binding = self.store.get_binding(user_id, binding_id).await?;
        if binding.status != BindingStatus::Active {
            return Err(TabularError::Connection(format!(
                "binding '{}' is {}",
                binding.display_name,
                binding.status.as_str()
            )));
        }
        Ok(binding)
    }

    fn decrypt_credential(&self, binding: &Binding) -> Result<String, TabularError> {
        let plain = self
            .crypto
            .decrypt(&binding.credential_blob)
            .map_err(|e| TabularError::Connection(e.to_string()))?;
        String::from_utf8(plain)
            .map_err(|_| TabularError::Connection("credential is not valid UTF-8".into()))
    }
}

fn snapshot_of(binding: &Binding) -> Result<SchemaSnapshot, TabularError> {
    serde_json::from_value(binding.schema_snapshot.clone())
        .map_err(|e| TabularError::Connection(format!("corrupt schema snapshot: {e}")))
}

fn generation_request(
    snapshot: &SchemaSnapshot,
    question: &str,
    context: &str,
    feedback: Option<&str>,
) -> CompletionRequest {
    let mut user = format!(
        "Database schema (table(columns)):\n{}\n\n",
        snapshot.prompt_block()
    );
    if !context.trim().is_empty() {
        user.push_str(&format!("Conversation context:\n{context}\n\n"));
    }
    user.push_str(&format!("Question: {question}"));
    if let Some(reason) = feedback {
        user.push_str(&format!(
            "\n\nA previous attempt was rejected: {reason}. Produce a corrected statement."
        ));
    }
    CompletionRequest {
        messages: vec![
            ChatMessage::system(
                "You translate questions into SQL. Reply with exactly one read-only SELECT \
                 statement for the given schema. No commentary, no data modification, only \
                 tables that appear in the schema.",
            ),
            ChatMessage::user(user),
        ],
        ..Default::default()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
