//! HealthEvent phase machine
//!
//! Phases advance monotonically:
//!
//! ```text
//! "" / New    → Quarantined
//! Quarantined → Draining | Drained
//! Draining    → Drained
//! Drained     → Remediated
//! any non-terminal → Resolved
//! ```
//!
//! `Resolved` is terminal. An empty phase string on the wire is treated
//! as `New`.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};

/// Coarse lifecycle position of a HealthEvent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventPhase {
    /// Freshly published, no controller has acted yet
    #[default]
    New,
    /// Node cordoned (or quarantine skipped)
    Quarantined,
    /// Pod eviction in progress
    Draining,
    /// No evictable pods remain on the node
    Drained,
    /// The RebootNode side effect completed
    Remediated,
    /// A healthy signal arrived; terminal
    Resolved,
}

impl EventPhase {
    /// Position in the pipeline, for monotonicity checks
    fn rank(self) -> u8 {
        match self {
            EventPhase::New => 0,
            EventPhase::Quarantined => 1,
            EventPhase::Draining => 2,
            EventPhase::Drained => 3,
            EventPhase::Remediated => 4,
            EventPhase::Resolved => 5,
        }
    }

    /// True once the phase can no longer change
    pub fn is_terminal(self) -> bool {
        self == EventPhase::Resolved
    }

    fn as_str(self) -> &'static str {
        match self {
            EventPhase::New => "New",
            EventPhase::Quarantined => "Quarantined",
            EventPhase::Draining => "Draining",
            EventPhase::Drained => "Drained",
            EventPhase::Remediated => "Remediated",
            EventPhase::Resolved => "Resolved",
        }
    }
}

impl std::fmt::Display for EventPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// Records are created with an empty phase; keep that wire form stable and
// accept both spellings on the way in.
impl Serialize for EventPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            EventPhase::New => serializer.serialize_str(""),
            other => serializer.serialize_str(other.as_str()),
        }
    }
}

impl<'de> Deserialize<'de> for EventPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "" | "New" => Ok(EventPhase::New),
            "Quarantined" => Ok(EventPhase::Quarantined),
            "Draining" => Ok(EventPhase::Draining),
            "Drained" => Ok(EventPhase::Drained),
            "Remediated" => Ok(EventPhase::Remediated),
            "Resolved" => Ok(EventPhase::Resolved),
            other => Err(de::Error::unknown_variant(
                other,
                &[
                    "New",
                    "Quarantined",
                    "Draining",
                    "Drained",
                    "Remediated",
                    "Resolved",
                ],
            )),
        }
    }
}

/// Whether a status write may move an event from `from` to `to`.
///
/// Same-phase writes are allowed (condition refreshes); everything else must
/// follow the pipeline graph. Any non-terminal phase may jump to `Resolved`.
pub fn is_valid_transition(from: EventPhase, to: EventPhase) -> bool {
    use EventPhase::*;

    if from == to {
        return true;
    }

    if to == Resolved {
        return !from.is_terminal();
    }

    matches!(
        (from, to),
        (New, Quarantined)
            | (Quarantined, Draining)
            | (Quarantined, Drained)
            | (Draining, Drained)
            | (Drained, Remediated)
    )
}

/// Monotonicity predicate used by invariant checks in tests: phases never
/// move backwards.
pub fn is_forward(from: EventPhase, to: EventPhase) -> bool {
    to.rank() >= from.rank()
}
