//! Control-plane types: channel commands, the provider state machine, and the
//! mapping from keywords onto runtime subscriptions.
//!
//! Planning is pure so it can be tested without a runtime; the agent commits
//! the planned mask and owns the side effects.

use crate::profiler::events::Keywords;
use crate::profiler::runtime::SubscriptionFlags;
use std::env;

/// Environment variable consulted once at startup for keyword hints. Holds a
/// decimal or `0x`-prefixed keyword mask; absence means no hints.
pub const HOST_KEYWORDS_VAR: &str = "ETW_CLR_PROFILER_KEYWORDS";

/// Command codes delivered by the tracing channel's control callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Enable,
    CaptureState,
    Disable,
}

#[derive(Debug, Clone)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub level: u8,
    pub keywords: Keywords,
    /// Opaque filter blob from the listener. Accepted but currently unused.
    pub filter: Option<Vec<u8>>,
}

impl ControlRequest {
    pub fn new(command: ControlCommand, keywords: Keywords) -> Self {
        ControlRequest {
            command,
            level: 0,
            keywords,
            filter: None,
        }
    }
}

/// Provider lifecycle. `Detaching` is terminal within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Disarmed,
    Armed,
    Detaching,
}

/// Subscription changes an enable command asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnablePlan {
    pub flags: SubscriptionFlags,
    /// True when the sampled-allocation keyword selects the adaptive sampler.
    pub smart_sampling: bool,
}

/// Map enable keywords onto subscription flags.
///
/// Bits outside [`SubscriptionFlags::AGENT_OWNED`] are preserved as found.
/// Allocation and call monitoring need capabilities that only exist when the
/// agent was loaded at process startup; when attached later those requests are
/// silently ignored.
pub fn plan_enable(
    keywords: Keywords,
    old_flags: SubscriptionFlags,
    loaded_at_startup: bool,
) -> EnablePlan {
    let mut flags = old_flags.without(SubscriptionFlags::AGENT_OWNED);
    flags |= SubscriptionFlags::MONITOR_MODULE_LOADS;
    let mut smart_sampling = false;

    if keywords.intersects(Keywords::GC_FAMILY) {
        flags |= SubscriptionFlags::MONITOR_GC;
    }
    if keywords.intersects(Keywords::ALLOC_FAMILY) && loaded_at_startup {
        flags |= SubscriptionFlags::MONITOR_OBJECT_ALLOCATED;
        if keywords.intersects(Keywords::GC_ALLOC_SAMPLED) {
            smart_sampling = true;
        }
    }
    if keywords.intersects(Keywords::CALL) && loaded_at_startup {
        flags |= SubscriptionFlags::MONITOR_ENTER_LEAVE;
    }

    EnablePlan {
        flags,
        smart_sampling,
    }
}

/// Strip the agent-owned bits, leaving everything else untouched.
pub fn plan_disable(old_flags: SubscriptionFlags) -> SubscriptionFlags {
    old_flags.without(SubscriptionFlags::AGENT_OWNED)
}

/// Read the host's persisted startup keyword hint. Absence is not an error.
/// The detach bit makes no sense as a standing hint and is masked out.
pub fn host_keyword_hint() -> Keywords {
    parse_keyword_hint(env::var(HOST_KEYWORDS_VAR).ok().as_deref())
}

fn parse_keyword_hint(raw: Option<&str>) -> Keywords {
    let Some(raw) = raw else {
        return Keywords::NONE;
    };
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    match parsed {
        Ok(bits) => Keywords::from_bits(bits).without(Keywords::DETACH),
        Err(_) => {
            log::warn!("ignoring unparseable {HOST_KEYWORDS_VAR} value {raw:?}");
            Keywords::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_at_startup_maps_all_families() {
        let keywords = Keywords::GC | Keywords::GC_ALLOC_SAMPLED | Keywords::CALL;
        let plan = plan_enable(keywords, SubscriptionFlags::NONE, true);
        assert!(plan.flags.contains(
            SubscriptionFlags::MONITOR_MODULE_LOADS
                | SubscriptionFlags::MONITOR_GC
                | SubscriptionFlags::MONITOR_OBJECT_ALLOCATED
                | SubscriptionFlags::MONITOR_ENTER_LEAVE
        ));
        assert!(plan.smart_sampling);
    }

    #[test]
    fn test_enable_after_attach_ignores_startup_only_requests() {
        let keywords = Keywords::GC_ALLOC_SAMPLED | Keywords::CALL;
        let plan = plan_enable(keywords, SubscriptionFlags::NONE, false);
        assert!(!plan.flags.intersects(
            SubscriptionFlags::MONITOR_OBJECT_ALLOCATED | SubscriptionFlags::MONITOR_ENTER_LEAVE
        ));
        // Module loads are always monitored while enabled.
        assert!(plan.flags.contains(SubscriptionFlags::MONITOR_MODULE_LOADS));
        assert!(!plan.smart_sampling);
    }

    #[test]
    fn test_plain_alloc_keyword_does_not_select_sampler() {
        let plan = plan_enable(Keywords::GC_ALLOC, SubscriptionFlags::NONE, true);
        assert!(plan
            .flags
            .contains(SubscriptionFlags::MONITOR_OBJECT_ALLOCATED));
        assert!(!plan.smart_sampling);
    }

    #[test]
    fn test_enable_preserves_foreign_and_startup_bits() {
        let old = SubscriptionFlags::ENABLE_OBJECT_ALLOCATED
            | SubscriptionFlags::DISABLE_INLINING
            | SubscriptionFlags::MONITOR_OBJECT_ALLOCATED;
        let plan = plan_enable(Keywords::GC, old, true);
        // Owned monitor bit recomputed away, startup capabilities untouched.
        assert!(plan.flags.contains(
            SubscriptionFlags::ENABLE_OBJECT_ALLOCATED | SubscriptionFlags::DISABLE_INLINING
        ));
        assert!(!plan
            .flags
            .contains(SubscriptionFlags::MONITOR_OBJECT_ALLOCATED));
    }

    #[test]
    fn test_disable_strips_only_owned_bits() {
        let old = SubscriptionFlags::MONITOR_GC
            | SubscriptionFlags::MONITOR_MODULE_LOADS
            | SubscriptionFlags::MONITOR_OBJECT_ALLOCATED
            | SubscriptionFlags::ENABLE_OBJECT_ALLOCATED
            | SubscriptionFlags::MONITOR_ENTER_LEAVE;
        let stripped = plan_disable(old);
        assert_eq!(
            stripped,
            SubscriptionFlags::ENABLE_OBJECT_ALLOCATED | SubscriptionFlags::MONITOR_ENTER_LEAVE
        );
    }

    #[test]
    fn test_parse_keyword_hint_formats() {
        assert_eq!(parse_keyword_hint(None), Keywords::NONE);
        assert_eq!(parse_keyword_hint(Some("36")), Keywords::from_bits(36));
        assert_eq!(
            parse_keyword_hint(Some("0x24")),
            Keywords::CALL_SAMPLED | Keywords::GC_ALLOC_SAMPLED
        );
        assert_eq!(parse_keyword_hint(Some(" 0X8 ")), Keywords::GC_HEAP);
        assert_eq!(parse_keyword_hint(Some("garbage")), Keywords::NONE);
    }

    #[test]
    fn test_parse_keyword_hint_masks_detach() {
        let hint = parse_keyword_hint(Some("0xFF"));
        assert!(!hint.intersects(Keywords::DETACH));
        assert!(hint.contains(Keywords::GC_FAMILY | Keywords::CALL_FAMILY));
    }
}
