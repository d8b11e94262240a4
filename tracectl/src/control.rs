// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of the levels of the declared tracing targets.

use crate::targets::{TRACE_TARGETS, TraceTarget};
use ordermap::OrderMap;
use std::sync::{Mutex, MutexGuard, OnceLock};
use thiserror::Error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{Registry, fmt};

/// Level used for anything not covered by a declared target.
pub const DEFAULT_DEFAULT_LOGLEVEL: LevelFilter = LevelFilter::INFO;

/// Name of the environment variable whose directives are appended to the configured ones.
const ENV_DIRECTIVES: &str = "RUST_LOG";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TraceCtlError {
    #[error("Invalid directive '{0}': expected <target|tag>=<level>")]
    InvalidDirective(String),
    #[error("Invalid level '{0}'")]
    InvalidLevel(String),
    #[error("No target or tag named '{0}'")]
    UnknownTarget(String),
    #[error("Tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("Failed to reload tracing filter: {0}")]
    Reload(String),
    #[error("Tracing control lock poisoned")]
    Poisoned,
}

struct ControlState {
    default: Option<LevelFilter>,
    levels: OrderMap<&'static str, LevelFilter>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

/// Process-wide tracing configuration.
///
/// Levels start at the defaults given to [`trace_target!`](crate::trace_target) and can be
/// changed per target, or per tag, at any time. Changes take effect immediately once [`init`]
/// has installed the subscriber.
pub struct TracingControl {
    state: Mutex<ControlState>,
}

impl TracingControl {
    fn new() -> Self {
        let mut levels = OrderMap::new();
        for target in TRACE_TARGETS {
            levels.insert(target.name, target.level);
        }
        Self {
            state: Mutex::new(ControlState {
                default: None,
                levels,
                reload: None,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ControlState>, TraceCtlError> {
        self.state.lock().map_err(|_| TraceCtlError::Poisoned)
    }

    /// The declared targets.
    #[must_use]
    pub fn targets(&self) -> &'static [TraceTarget] {
        TRACE_TARGETS.static_slice()
    }

    /// Current level of the named target.
    #[must_use]
    pub fn level(&self, name: &str) -> Option<LevelFilter> {
        self.lock().ok()?.levels.get(name).copied()
    }

    /// Set the level for anything not covered by a declared target.
    pub fn set_default_level(&self, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut state = self.lock()?;
        state.default = Some(level);
        Self::apply(&state)
    }

    /// Set the level of a target, or of all the targets carrying a tag.
    pub fn set_level(&self, name: &str, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut state = self.lock()?;
        Self::set_level_locked(&mut state, name, level)?;
        Self::apply(&state)
    }

    fn set_level_locked(
        state: &mut ControlState,
        name: &str,
        level: LevelFilter,
    ) -> Result<(), TraceCtlError> {
        let mut found = false;
        for target in TRACE_TARGETS {
            if target.name == name || target.has_tag(name) {
                state.levels.insert(target.name, level);
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(TraceCtlError::UnknownTarget(name.to_owned()))
        }
    }

    /// Apply a comma separated list of `<target|tag>=<level>` directives.
    ///
    /// A bare level (no `=`) sets the default level. Nothing is changed if any directive is
    /// invalid.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let mut parsed = Vec::new();
        for directive in input.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (name, level) = match directive.split_once('=') {
                Some((name, level)) => (Some(name.trim()), level.trim()),
                None => (None, directive),
            };
            if name.is_some_and(str::is_empty) {
                return Err(TraceCtlError::InvalidDirective(directive.to_owned()));
            }
            let level: LevelFilter = level
                .parse()
                .map_err(|_| TraceCtlError::InvalidLevel(level.to_owned()))?;
            parsed.push((name, level));
        }

        let mut state = self.lock()?;
        let mut updated = ControlState {
            default: state.default,
            levels: state.levels.clone(),
            reload: None,
        };
        for (name, level) in parsed {
            match name {
                Some(name) => Self::set_level_locked(&mut updated, name, level)?,
                None => updated.default = Some(level),
            }
        }
        state.default = updated.default;
        state.levels = updated.levels;
        Self::apply(&state)
    }

    /// Build the filter that corresponds to the current configuration, followed by any
    /// directives found in `RUST_LOG`.
    #[must_use]
    pub fn env_filter(&self) -> EnvFilter {
        match self.lock() {
            Ok(state) => Self::build_filter(&state),
            Err(_) => EnvFilter::new(DEFAULT_DEFAULT_LOGLEVEL.to_string()),
        }
    }

    fn build_filter(state: &ControlState) -> EnvFilter {
        let mut directives: Vec<String> = state
            .levels
            .iter()
            .map(|(name, level)| format!("{name}={level}"))
            .collect();
        if let Ok(env) = std::env::var(ENV_DIRECTIVES) {
            directives.push(env);
        }
        EnvFilter::builder()
            .with_default_directive(state.default.unwrap_or(DEFAULT_DEFAULT_LOGLEVEL).into())
            .parse_lossy(directives.join(","))
    }

    fn apply(state: &ControlState) -> Result<(), TraceCtlError> {
        if let Some(handle) = &state.reload {
            handle
                .reload(Self::build_filter(state))
                .map_err(|e| TraceCtlError::Reload(e.to_string()))?;
        }
        Ok(())
    }

    fn install(&self) -> Result<(), TraceCtlError> {
        let mut state = self.lock()?;
        if state.reload.is_some() {
            return Err(TraceCtlError::AlreadyInitialized);
        }
        let (filter, handle) = reload::Layer::new(Self::build_filter(&state));
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|_| TraceCtlError::AlreadyInitialized)?;
        state.reload = Some(handle);
        Ok(())
    }
}

/// Get the process-wide [`TracingControl`].
#[must_use]
pub fn get_trace_ctl() -> &'static TracingControl {
    static TRACE_CTL: OnceLock<TracingControl> = OnceLock::new();
    TRACE_CTL.get_or_init(TracingControl::new)
}

/// Install the global tracing subscriber, filtered by the [`TracingControl`] configuration.
pub fn init() -> Result<(), TraceCtlError> {
    get_trace_ctl().install()
}
