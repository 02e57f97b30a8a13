/*
 * Lifecycle - Ephemeral Pull Request Environments on Kubernetes
 * Copyright (C) 2025 Lifecycle team
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

//! Build/deploy lifecycle orchestrator
//!
//! This crate takes a queued build of a pull-request environment through image
//! construction, namespace and service-account provisioning, manifest synthesis,
//! rollout and readiness verification, and teardown.

pub mod cluster;
pub mod config;
pub mod controller;
pub mod declarative;
pub mod env;
pub mod graph;
pub mod images;
pub mod links;
pub mod manifest;
pub mod models;
pub mod namespace;
pub mod queue;
pub mod rollout;
pub mod store;
pub mod ttl;
pub mod types;

// Re-export commonly used types
pub use config::{ConfigProvider, LifecycleConfig};
pub use controller::{BuildController, ControllerDeps, RunOutcome};
pub use models::{Build, BuildStatus, CapacityType, Deploy, DeployStatus, DeployType};
pub use types::{Error, Result};
