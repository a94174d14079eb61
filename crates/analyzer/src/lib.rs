//! Supervision of an external static-analysis engine.
//!
//! The crate keeps exactly one analyzer process alive behind an [`AnalyzerClient`]:
//! - [`launcher`]: spawns the process; tests swap in an in-process analyzer.
//! - [`endpoint`]: the private socket (or named pipe) the analyzer connects back to.
//! - [`client`]: lifecycle state machine, JSON-RPC requests and progress forwarding.
//! - [`coalescer`]: debounces editor changes into notify and partial-analysis batches.
//!
//! A shared [`vigil_worker::ExclusionGate`] keeps manual analyses and coalesced flushes from
//! overlapping on the wire.

pub mod analysis;
pub mod client;
pub mod coalescer;
pub mod config;
pub mod endpoint;
mod error;
pub mod launcher;
pub mod solution;
mod state;

pub use analysis::{AnalysisOutcome, AnalysisReport, AnalysisRequest, AnalysisResponse, Incident, PartialSummary, RuleSet, Violation};
pub use client::{AnalyzerClient, methods};
pub use coalescer::{ChangeCoalescer, ChangeSink, CoalescerConfig, FileChange};
pub use config::{AnalyzerConfig, BackoffSettings, ConfigError, DEFAULT_READY_MARKER};
pub use endpoint::{BoxReader, BoxWriter, LocalEndpoint};
pub use error::{Error, ErrorCategory, Result};
pub use launcher::{AnalyzerLauncher, LaunchSpec, LaunchedProcess, ProcessControl, ProcessExit, ProcessLauncher};
pub use solution::{EffortLevel, EffortLimits, ParseEffortError, ProgressEvent, Solution, SolutionParams, SolutionRequest};
pub use state::ServerState;
