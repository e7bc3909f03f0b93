// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//!
//! The composition point of the server: intent classification, sub-agent
//! planning and execution, prompt assembly, response streaming, budget
//! admission and metering, and the conversation service.

pub mod budget;
pub mod context;
pub mod conversation;
pub mod events;
pub mod intent;
pub mod memory;
pub mod orchestrator;
pub mod prompts;

pub use budget::{Admission, BudgetGovernor};
pub use events::{ErrorCode, ToolResultKind, TurnEvent, TurnStats};
pub use intent::{Plan, PlanInputs};
pub use memory::MemoryRecall;
pub use orchestrator::{Orchestrator, TurnOptions, TurnRequest};
