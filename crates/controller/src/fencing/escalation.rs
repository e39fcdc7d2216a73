//! Method escalation
//!
//! Given the selected configuration, the request's active method and the state
//! of that method's Job, decide what happens next. Methods are tried strictly
//! in declared order; the active method is located by name in that list.

use super::config::FencingConfig;
use std::time::Duration;

/// Observed state of the active method's Job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
    /// No Job exists (never created, failed to build, or deleted)
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The active method's Job is still running
    Wait { method: String },
    /// Dispatch the method at `index`
    Dispatch { index: usize },
    /// The method at `index` may not run yet
    Delay { index: usize, remaining: Duration },
    /// Fencing succeeded through `method`
    Complete { method: String },
    /// Every method was tried; `last` is the one that failed last
    Exhausted { last: Option<String> },
}

/// Decide the next step for a request.
///
/// `elapsed` is the time since the request became valid and gates methods
/// that declare `requireAfterSeconds`.
pub fn next_step(
    config: &FencingConfig,
    active: Option<&str>,
    state: JobState,
    elapsed: Duration,
) -> Decision {
    let Some(name) = active else {
        return candidate(config, 0, elapsed, None);
    };

    // the active method vanished from a reloaded config: start over
    let Some((index, method)) = config.method(name) else {
        return candidate(config, 0, elapsed, None);
    };

    match state {
        JobState::Running => Decision::Wait {
            method: method.name.clone(),
        },
        JobState::Succeeded if method.stop_on_success => Decision::Complete {
            method: method.name.clone(),
        },
        JobState::Succeeded => {
            if index + 1 < config.methods.len() {
                candidate(config, index + 1, elapsed, Some(name))
            } else {
                Decision::Complete {
                    method: method.name.clone(),
                }
            }
        }
        JobState::Failed | JobState::Missing => candidate(config, index + 1, elapsed, Some(name)),
    }
}

fn candidate(config: &FencingConfig, index: usize, elapsed: Duration, last: Option<&str>) -> Decision {
    let Some(method) = config.methods.get(index) else {
        return Decision::Exhausted {
            last: last.map(str::to_string),
        };
    };

    if let Some(required) = method.require_after_seconds {
        let required = Duration::from_secs(u64::from(required));
        if elapsed < required {
            return Decision::Delay {
                index,
                remaining: required - elapsed,
            };
        }
    }
    Decision::Dispatch { index }
}
