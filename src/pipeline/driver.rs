use chrono::Local;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::module::{Module, ModuleInvocation, ModuleRunner};
use super::runlog::{RunLog, RunLogEntry, RunLogError, RunStatus};
use crate::session::SessionContext;

/// Step name the run log uses for spike time conversion
pub const CONVERSION_STEP: &str = "spike_times_to_sec";

/// Progress of one recording through the module sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingState {
    Pending,
    Running(Module),
    Completed,
    Failed { module: Module, reason: String },
    /// Every module ran but the spike times could not be converted
    ConversionFailed { reason: String },
}

impl RecordingState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordingState::Completed
                | RecordingState::Failed { .. }
                | RecordingState::ConversionFailed { .. }
        )
    }
}

/// Result of driving one recording
#[derive(Debug, Clone)]
pub struct RecordingOutcome {
    pub session_id: String,
    pub probe: String,
    pub state: RecordingState,
    /// Modules attempted, in order, with wall time
    pub timings: Vec<(Module, Duration)>,
    /// Extra remarks for the log row's detail column
    pub notes: Vec<String>,
}

impl RecordingOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == RecordingState::Completed
    }

    pub fn note(&mut self, remark: String) {
        self.notes.push(remark);
    }

    /// Mark a completed recording as failed at the conversion step
    pub fn fail_conversion(&mut self, reason: String) {
        self.state = RecordingState::ConversionFailed { reason };
    }

    fn log_entry(&self) -> RunLogEntry {
        let (status, failed_module, reason) = match &self.state {
            RecordingState::Failed { module, reason } => {
                (RunStatus::Failed, Some(module.name().to_string()), Some(reason))
            }
            RecordingState::ConversionFailed { reason } => {
                (RunStatus::Failed, Some(CONVERSION_STEP.to_string()), Some(reason))
            }
            _ => (RunStatus::Completed, None, None),
        };
        let detail = reason
            .into_iter()
            .chain(&self.notes)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("; ");

        RunLogEntry {
            timestamp: Local::now(),
            session_id: self.session_id.clone(),
            probe: self.probe.clone(),
            modules: self
                .timings
                .iter()
                .map(|(m, d)| (m.name().to_string(), d.as_secs_f64()))
                .collect(),
            status,
            failed_module,
            detail,
        }
    }
}

/// Runs the configured modules, in order, for one recording at a time
pub struct PipelineDriver<'a> {
    runner: &'a dyn ModuleRunner,
    modules: &'a [Module],
    log: &'a RunLog,
}

impl<'a> PipelineDriver<'a> {
    pub fn new(runner: &'a dyn ModuleRunner, modules: &'a [Module], log: &'a RunLog) -> Self {
        Self {
            runner,
            modules,
            log,
        }
    }

    /// Run the module sequence for one recording.
    ///
    /// A module failure stops this recording's remaining modules and is
    /// reported in the outcome. Nothing is logged until [`record`] is called,
    /// so later steps can still change the outcome.
    ///
    /// [`record`]: PipelineDriver::record
    pub async fn drive(&self, ctx: &SessionContext) -> RecordingOutcome {
        let artifact_path = ctx.artifact_path();
        let mut state = RecordingState::Pending;
        let mut timings = Vec::with_capacity(self.modules.len());

        info!("Processing {} ({} modules)", ctx.label(), self.modules.len());

        for &module in self.modules {
            state = RecordingState::Running(module);
            debug!("{} -> {:?}", ctx.label(), state);

            let invocation = ModuleInvocation {
                artifact_path: &artifact_path,
                output_json: ctx.layout.module_output_json(module.name()),
                log_path: self.log.path(),
            };

            let started = Instant::now();
            let result = self.runner.run(module, &invocation).await;
            let elapsed = started.elapsed();
            timings.push((module, elapsed));

            match result {
                Ok(()) => info!("{}: {} finished in {:.1}s", ctx.label(), module, elapsed.as_secs_f64()),
                Err(e) => {
                    warn!("{}: {} failed, skipping remaining modules: {}", ctx.label(), module, e);
                    state = RecordingState::Failed {
                        module,
                        reason: e.to_string(),
                    };
                    break;
                }
            }
        }

        if !state.is_terminal() {
            state = RecordingState::Completed;
        }

        RecordingOutcome {
            session_id: ctx.session_id.clone(),
            probe: ctx.probe.clone(),
            state,
            timings,
            notes: Vec::new(),
        }
    }

    /// Append the recording's row to the run log
    pub fn record(&self, outcome: &RecordingOutcome) -> Result<(), RunLogError> {
        self.log.append(&outcome.log_entry())
    }
}
