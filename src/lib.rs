//! boardmedic -- CPU and RAM load diagnostics for single-board computers.
//!
//! The [`engine`] runs one bounded load test (CPU burn or RAM write/verify),
//! samples it while it runs, and reduces the samples into a [`RunResult`].
//! Every failure, including bad input, ends up inside that result rather
//! than as a panic or an `Err`.
//!
//! ```no_run
//! use std::time::Duration;
//! use boardmedic::{run_load_test, RunRequest};
//!
//! let result = run_load_test(RunRequest::cpu(Duration::from_secs(5)), None, None);
//! println!("{}", boardmedic::report::format_summary(&result));
//! ```

pub mod config;
pub mod engine;
pub mod report;

pub use config::EngineConfig;
pub use engine::{
    run_load_test, run_load_test_async, Backend, CancellationToken, LoadEngine, LoadKind,
    LoadPlan, RunRequest, RunResult, RunStatus, Sample,
};
