// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// Tests use unwrap freely
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Keel
//!
//! A declarative, dependency-ordered infrastructure provisioning engine.
//!
//! ## Overview
//!
//! Keel reads a deployment file describing cloud resources and the
//! references between them, and converges recorded state towards it:
//!
//! - Resources are ordered by explicit `depends_on` entries and by the
//!   `${resource.output}` references in their attributes
//! - Each run compares declared attributes with recorded fingerprints and
//!   produces a plan of create, update, replace and delete actions
//! - Independent actions run concurrently, with retries, timeouts and
//!   cascade rollback when something fails
//! - State is persisted after every action, locally or in S3
//!
//! ## Modules
//!
//! - [`config`]: Deployment file parsing and validation
//! - [`model`]: Resource graph, attribute values and fingerprints
//! - [`catalog`]: Resource adapters and the built-in kinds
//! - [`provider`]: HTTP client for the provider API
//! - [`planner`]: Dependency resolution, diffing and plan execution
//! - [`engine`]: Locked plan/apply/destroy runs and drift checks
//! - [`state`]: State storage backends (memory, local, S3)
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! deployment:
//!   name: corpweb
//!   environment: prod
//!
//! resources:
//!   - id: vpc
//!     type: network
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - id: web_sg
//!     type: security_group
//!     attributes:
//!       network: ${vpc.id}
//!       ingress:
//!         - { port: 443, source: 0.0.0.0/0 }
//!
//! outputs:
//!   network_id:
//!     value: ${vpc.id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod catalog;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use catalog::{AdapterRegistry, ResourceAdapter, ResourceKind};
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, DeploymentFile};
pub use engine::{DriftReport, Engine, RunResult};
pub use error::{KeelError, Result};
pub use model::{DeploymentGraph, Fingerprinter};
pub use planner::{ApplyReport, DiffEngine, Plan, PlanExecutor};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};
