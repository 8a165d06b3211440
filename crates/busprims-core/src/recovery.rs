//! Disaster recovery plan (DRP) and the error handler that consults it.
//!
//! A [`RecoveryPlan`] is built once, at component construction, and never
//! mutated afterwards. The [`ErrorHandler`] logs every error it sees and, for
//! `High`/`Critical` severities, runs the recovery action registered for the
//! error's code.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::error::{BusError, ErrorCode, Severity};

/// Zero-argument recovery closure. Returns `true` when the condition was
/// recovered.
pub type RecoveryAction = Arc<dyn Fn() -> bool + Send + Sync>;

/// Immutable table of recovery actions keyed by error code.
#[derive(Clone, Default)]
pub struct RecoveryPlan {
    actions: HashMap<ErrorCode, RecoveryAction>,
}

impl RecoveryPlan {
    /// Start building a plan.
    pub fn builder() -> RecoveryPlanBuilder {
        RecoveryPlanBuilder::default()
    }

    /// A plan with no actions.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether an action is registered for `code`.
    pub fn covers(&self, code: ErrorCode) -> bool {
        self.actions.contains_key(&code)
    }

    /// Run the action for `code`. Returns `false` when none is registered.
    pub fn execute(&self, code: ErrorCode) -> bool {
        match self.actions.get(&code) {
            Some(action) => action(),
            None => false,
        }
    }
}

impl fmt::Debug for RecoveryPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<&str> = self.actions.keys().map(|code| code.as_str()).collect();
        codes.sort_unstable();
        f.debug_struct("RecoveryPlan")
            .field("codes", &codes)
            .finish()
    }
}

/// One-shot builder for [`RecoveryPlan`].
#[derive(Default)]
pub struct RecoveryPlanBuilder {
    actions: HashMap<ErrorCode, RecoveryAction>,
}

impl RecoveryPlanBuilder {
    /// Register the recovery action for `code`. A later registration for the
    /// same code replaces the earlier one.
    pub fn on<F>(mut self, code: ErrorCode, action: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.actions.insert(code, Arc::new(action));
        self
    }

    pub fn build(self) -> RecoveryPlan {
        RecoveryPlan {
            actions: self.actions,
        }
    }
}

/// What to do with a `Critical` error that was not recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log and hand [`Disposition::Fatal`] back to the caller.
    Escalate,
}

/// Outcome of [`ErrorHandler::handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Low/medium severity: logged, the caller decides what to do.
    Logged,
    /// High or above, and the registered action recovered it.
    Recovered,
    /// High severity with no action, or the action failed.
    Unrecovered,
    /// Critical and unrecovered under [`FatalPolicy::Escalate`].
    Fatal,
}

impl Disposition {
    pub fn is_recovered(self) -> bool {
        matches!(self, Disposition::Recovered)
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, Disposition::Fatal)
    }
}

/// Logs errors and drives the recovery plan.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    plan: Arc<RecoveryPlan>,
    fatal: FatalPolicy,
}

impl ErrorHandler {
    /// Handler over `plan` that aborts on unrecovered critical errors.
    pub fn new(plan: RecoveryPlan) -> Self {
        Self::with_policy(plan, FatalPolicy::Abort)
    }

    pub fn with_policy(plan: RecoveryPlan, fatal: FatalPolicy) -> Self {
        Self {
            plan: Arc::new(plan),
            fatal,
        }
    }

    pub fn plan(&self) -> &RecoveryPlan {
        &self.plan
    }

    pub fn fatal_policy(&self) -> FatalPolicy {
        self.fatal
    }

    /// Log `err`, then run recovery for high-severity errors.
    pub fn handle(&self, err: &BusError) -> Disposition {
        log_error(err);

        if err.severity() < Severity::High {
            return Disposition::Logged;
        }

        if self.plan.execute(err.code()) {
            debug!(code = %err.code(), "recovery action succeeded");
            return Disposition::Recovered;
        }

        if err.severity() < Severity::Critical {
            return Disposition::Unrecovered;
        }

        match self.fatal {
            FatalPolicy::Abort => {
                error!(code = %err.code(), message = err.message(), "unrecovered critical error, aborting");
                std::process::abort();
            }
            FatalPolicy::Escalate => Disposition::Fatal,
        }
    }
}

impl Default for ErrorHandler {
    fn default() -> Self {
        Self::new(RecoveryPlan::empty())
    }
}

fn log_error(err: &BusError) {
    match err.severity() {
        Severity::Low => debug!(
            severity = %err.severity(),
            code = %err.code(),
            message = err.message(),
            "bus error"
        ),
        Severity::Medium => warn!(
            severity = %err.severity(),
            code = %err.code(),
            message = err.message(),
            "bus error"
        ),
        Severity::High | Severity::Critical => error!(
            severity = %err.severity(),
            code = %err.code(),
            message = err.message(),
            "bus error"
        ),
    }
}
