/*
 * 5D Labs Agent Platform - Spoke Work Agent
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

//! Spoke work agent library
//!
//! Applies hub `ManifestWork`s onto a managed cluster, records every object it
//! creates in an `AppliedManifestWork`, and holds that record back with a
//! finalizer until each recorded object is provably gone.

pub mod crds;
pub mod tasks;

// Re-export commonly used types
pub use crds::{
    AppliedManifestResourceMeta, AppliedManifestWork, AppliedManifestWorkSpec,
    AppliedManifestWorkStatus, ManifestWork, ManifestWorkSpec,
};
pub use tasks::config::AgentConfig;
pub use tasks::{run_work_agent, AgentQueues};
