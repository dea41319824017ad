/*
 * 5D Labs Agent Platform - Kubernetes Orchestrator for AI Coding Agents
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Workflow agent pod reconciler
//!
//! Lazily provisions one agent pod per running workflow, composes its plugin
//! sidecars from `AgentPlugin` ConfigMaps and folds the pod's phase back into
//! the workflow when the pod fails.

pub mod agent;
pub mod crds;

// Re-export commonly used types
pub use agent::config::ControllerConfig;
pub use agent::naming::{agent_pod_name, is_agent_pod};
pub use agent::{AgentPodReconciler, Error, Result};
pub use crds::{TaskSet, Workflow, WorkflowSpec, WorkflowStatus};
