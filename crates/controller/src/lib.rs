/*
 * 5D Labs Fencing Controller - Kubernetes node fencing (STONITH)
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

//! Fencing controller core library
//!
//! This crate provides the fencing reconciliation engine: configuration
//! selection, method escalation, Job construction for fencing mechanisms,
//! and the node health monitor that raises `FencingRequest`s.

pub mod crds;
pub mod fencing;
pub mod tasks;

// Re-export commonly used types
pub use crds::{FencingRequest, FencingRequestSpec, FencingRequestStatus};
pub use fencing::{ConfigRegistry, FencingConfig, FencingError};
pub use tasks::config::ControllerConfig;
