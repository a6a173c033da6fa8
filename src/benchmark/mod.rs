//! Framework definitions, benchmark descriptors and work unit selection.
//!
//! A benchmark is an ordered list of tasks, each split into folds:
//!
//! ```text
//! benchmark ─┬─ task "kc2"  ── folds 0, 1
//!            ├─ task "iris" ── folds 0, 1
//!            └─ ...
//! ```
//!
//! Every (task, fold) pair is a [`WorkUnit`], the smallest piece of work a
//! backend executes.

pub mod descriptor;
pub mod framework;
pub mod selection;

pub use descriptor::{load_benchmark, BenchmarkDescriptor, TaskDefinition};
pub use framework::{load_framework, FrameworkDefinition};
pub use selection::{resolve, WorkUnit};
