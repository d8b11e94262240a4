// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Registry of tracing targets declared across the workspace.

use linkme::distributed_slice;
use tracing_subscriber::filter::LevelFilter;

/// A tracing target with the level it is enabled at unless configured otherwise.
#[derive(Debug)]
pub struct TraceTarget {
    /// Target name, as passed to `tracing` macros via `target: ...`.
    pub name: &'static str,
    /// Default level for the target.
    pub level: LevelFilter,
    /// Tags grouping targets so that they can be configured together.
    pub tags: &'static [&'static str],
}

impl TraceTarget {
    #[must_use]
    pub const fn new(
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self { name, level, tags }
    }

    /// Tell if this target carries the given tag.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(&tag)
    }
}

/// All the targets declared with [`trace_target!`](crate::trace_target).
#[distributed_slice]
pub static TRACE_TARGETS: [TraceTarget];

/// Declare a tracing target and its default level.
///
/// ```ignore
/// use tracectl::trace_target;
/// trace_target!("my-target", LevelFilter::INFO, &["my-tag"]);
/// ```
///
/// Crates using this macro need to depend on `linkme`.
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            #[allow(unused_imports)]
            use $crate::LevelFilter;
            #[::linkme::distributed_slice($crate::TRACE_TARGETS)]
            static TARGET: $crate::TraceTarget = $crate::TraceTarget::new($name, $level, $tags);
        };
    };
}

/// Look up a declared target by name.
#[must_use]
pub fn find_target(name: &str) -> Option<&'static TraceTarget> {
    TRACE_TARGETS.iter().find(|t| t.name == name)
}
