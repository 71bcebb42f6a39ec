//! # Stepwise
//!
//! An autopilot for code edits: a natural-language goal is planned into
//! steps, each step's proposed file changes are staged for review, approved
//! changes are promoted into the workspace and validated by the project's
//! test suite, and the job advances to the next step.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌────────────┐
//! │  Indexer   │──▶│   Runner   │──▶│   Stager   │──▶│ Test runner│
//! │chunk+embed │   │plan / step │   │stage/promote│  │ sh -c, t/o │
//! └────────────┘   └─────┬──────┘   └────────────┘   └────────────┘
//!                        │ persist
//!                        ▼
//!                  ┌────────────┐        ┌──────────┐  ┌──────────┐
//!                  │ Job store  │◀───────│  Engine  │◀─│ CLI/HTTP │
//!                  │ jobs/*.json│        └──────────┘  └──────────┘
//!                  └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! stepwise index build ./my-project
//! stepwise job start ./my-project "Add structured logging to the parser"
//! stepwise job approve ./my-project <job-id> --file src/parser.rs
//! stepwise serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Job, step, patch and index records |
//! | [`chunk`] | Line-aligned text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`indexer`] | Workspace index build, ranked search, context packing |
//! | [`chat`] | Chat providers and routing |
//! | [`extract`] | JSON payload extraction from model output |
//! | [`prompts`] | Plan and patch requests and their interpretation |
//! | [`diff`] | Unified diff application |
//! | [`stager`] | Patch staging, promotion and path policy |
//! | [`test_runner`] | Workspace test execution with timeout |
//! | [`store`] | Job persistence and repositories |
//! | [`runner`] | Per-job autopilot state machine |
//! | [`engine`] | Job control surface |
//! | [`error`] | Job control errors |
//! | [`server`] | HTTP API |

pub mod chat;
pub mod chunk;
pub mod config;
pub mod diff;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod indexer;
pub mod models;
pub mod prompts;
pub mod runner;
pub mod server;
pub mod stager;
pub mod store;
pub mod test_runner;
