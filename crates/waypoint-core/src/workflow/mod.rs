//! Workflow engine: validation, traversal, scope, interpretation and the
//! apply/run pipelines.
//!
//! - `validator` -- static graph checks producing a fatal/risk report
//! - `iterator` -- declared-order traversal and delete material
//! - `scope` -- node/var/iter namespaces with proxy attribution
//! - `expression` -- pluggable evaluator (JEXL by default) and templates
//! - `compare` -- comparison operations of switch conditions
//! - `instance` -- per-node execution state
//! - `execution` -- the stepped interpreter
//! - `apply` -- validate, diff by name and persist definitions
//! - `runner` -- persisted run lifecycle (start, resume, decide, cancel)

pub mod apply;
pub mod compare;
pub mod execution;
pub mod expression;
pub mod instance;
pub mod iterator;
pub mod runner;
pub mod scope;
pub mod validator;

pub use apply::{ApplyError, ApplyOutcome, WorkflowApplier};
pub use execution::{
    ExecutionContext, ExecutionError, ExecutionResult, RunOutcome, SubflowEnd, WorkflowGraph,
};
pub use runner::{RunReport, RunnerError, WorkflowRunner};
pub use validator::{validate_workflow, Report, ValidateOptions};
