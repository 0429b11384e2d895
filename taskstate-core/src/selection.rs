//! Reasons a dependency component version was selected.
//!
//! These are immutable tags recorded alongside resolution results. The set is
//! closed: every reason is one of the constants below.

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Why a component version was chosen during dependency resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ComponentSelectionReason {
    forced: bool,
    conflict_resolution: bool,
    selected_by_rule: bool,
    description: &'static str,
}

impl ComponentSelectionReason {
    pub const REQUESTED: Self = Self::new(false, false, false, "requested");
    pub const ROOT: Self = Self::new(false, false, false, "root");
    pub const FORCED: Self = Self::new(true, false, false, "forced");
    pub const CONFLICT_RESOLUTION: Self = Self::new(false, true, false, "conflict resolution");
    pub const SELECTED_BY_RULE: Self = Self::new(false, false, true, "selected by rule");
    pub const CONFLICT_RESOLUTION_BY_RULE: Self = Self::new(
        false,
        true,
        true,
        "selected by rule and conflict resolution",
    );

    const fn new(
        forced: bool,
        conflict_resolution: bool,
        selected_by_rule: bool,
        description: &'static str,
    ) -> Self {
        Self {
            forced,
            conflict_resolution,
            selected_by_rule,
            description,
        }
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn is_conflict_resolution(&self) -> bool {
        self.conflict_resolution
    }

    pub fn is_selected_by_rule(&self) -> bool {
        self.selected_by_rule
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Combine a reason with conflict resolution.
    ///
    /// Reasons that already involve conflict resolution are returned as-is.
    pub fn with_conflict_resolution(self) -> Result<Self, SelectionReasonError> {
        if self.conflict_resolution {
            Ok(self)
        } else if self == Self::SELECTED_BY_RULE {
            Ok(Self::CONFLICT_RESOLUTION_BY_RULE)
        } else if self == Self::REQUESTED {
            Ok(Self::CONFLICT_RESOLUTION)
        } else {
            Err(SelectionReasonError::NoConflictResolution {
                reason: self.description.to_string(),
            })
        }
    }
}

impl fmt::Display for ComponentSelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// Error combining selection reasons.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionReasonError {
    #[error("Cannot create conflict resolution selection reason for input: {reason}")]
    NoConflictResolution { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_becomes_conflict_resolution() {
        let combined = ComponentSelectionReason::REQUESTED
            .with_conflict_resolution()
            .unwrap();
        assert_eq!(combined, ComponentSelectionReason::CONFLICT_RESOLUTION);
    }

    #[test]
    fn test_rule_becomes_rule_and_conflict_resolution() {
        let combined = ComponentSelectionReason::SELECTED_BY_RULE
            .with_conflict_resolution()
            .unwrap();
        assert_eq!(combined, ComponentSelectionReason::CONFLICT_RESOLUTION_BY_RULE);
        assert!(combined.is_selected_by_rule());
        assert!(combined.is_conflict_resolution());
    }

    #[test]
    fn test_conflict_resolution_is_idempotent() {
        for reason in [
            ComponentSelectionReason::CONFLICT_RESOLUTION,
            ComponentSelectionReason::CONFLICT_RESOLUTION_BY_RULE,
        ] {
            assert_eq!(reason.with_conflict_resolution(), Ok(reason));
        }
    }

    #[test]
    fn test_forced_and_root_cannot_be_combined() {
        for reason in [ComponentSelectionReason::FORCED, ComponentSelectionReason::ROOT] {
            let err = reason.with_conflict_resolution().unwrap_err();
            assert!(err.to_string().contains(reason.description()));
        }
    }

    #[test]
    fn test_display_is_description() {
        assert_eq!(ComponentSelectionReason::FORCED.to_string(), "forced");
        assert!(ComponentSelectionReason::FORCED.is_forced());
        assert_eq!(
            ComponentSelectionReason::CONFLICT_RESOLUTION_BY_RULE.to_string(),
            "selected by rule and conflict resolution"
        );
    }
}
