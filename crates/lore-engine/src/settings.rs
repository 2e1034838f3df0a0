use std::time::Duration;

use lore_core::Clock;

/// Per-call evaluation settings. Passed by reference and never mutated by
/// the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalSettings {
    /// Keep writes in the modified set until `send_modifieds` is called.
    pub delay_sending_modifieds: bool,
    /// Ignore clock/quality ordering on writes.
    pub always_overwrite: bool,
    /// Commit global writes without queueing them for dissemination.
    pub treat_globals_as_locals: bool,
    /// Clock step applied by each local write.
    pub default_clock_increment: Clock,
    /// Printed (with `{name}` expansion) before evaluation.
    pub pre_print_statement: Option<String>,
    /// Printed (with `{name}` expansion) after evaluation.
    pub post_print_statement: Option<String>,
}

impl EvalSettings {
    /// Shared read-only defaults.
    pub const DEFAULT: EvalSettings = EvalSettings {
        delay_sending_modifieds: false,
        always_overwrite: false,
        treat_globals_as_locals: false,
        default_clock_increment: 1,
        pre_print_statement: None,
        post_print_statement: None,
    };

    /// Defaults with dissemination deferred to an explicit flush.
    pub fn delayed() -> Self {
        Self {
            delay_sending_modifieds: true,
            ..Self::DEFAULT
        }
    }
}

impl Default for EvalSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Settings for `wait`: evaluation settings plus polling bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitSettings {
    pub eval: EvalSettings,
    /// Upper bound on sleep between evaluations. Changes to the context
    /// wake the waiter early.
    pub poll_frequency: Duration,
    /// Zero waits indefinitely.
    pub max_wait_time: Duration,
}

impl WaitSettings {
    pub const DEFAULT: WaitSettings = WaitSettings {
        eval: EvalSettings::DEFAULT,
        poll_frequency: Duration::from_millis(100),
        max_wait_time: Duration::ZERO,
    };

    /// Defaults bounded by `max_wait_time`.
    pub fn with_timeout(max_wait_time: Duration) -> Self {
        Self {
            max_wait_time,
            ..Self::DEFAULT
        }
    }
}

impl Default for WaitSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}
