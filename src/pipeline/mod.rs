mod driver;
mod module;
mod runlog;

pub use driver::{PipelineDriver, RecordingOutcome, RecordingState, CONVERSION_STEP};
pub use module::{requires_sorter_copy, Module, ModuleRunner, PythonRunner};
pub use runlog::{RunLog, RunLogError};

#[cfg(test)]
pub(crate) use driver::tests::ScriptedRunner;
#[cfg(test)]
pub(crate) use runlog::RUN_LOG_HEADER;
