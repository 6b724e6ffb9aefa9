pub mod domain;
pub mod ledger;
pub mod ports;

pub use domain::{
    Command, Evaluation, ExecutionOutcome, Exercise, ExerciseKind, ExerciseWindow, GradeResults,
    NewSubmission, Submission, SubmissionRequest, SubmittedFile, Task, TaskFile,
};
pub use ledger::Rejection;
pub use ports::{
    ContainerRuntime, ContainerSpec, PortError, PortResult, SubmissionStore, SystemMetrics,
};
