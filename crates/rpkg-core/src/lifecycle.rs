use crate::CoreError;
use rpkg_schema::Lifecycle;

/// Allowed moves: Draft → Proposed (propose), Proposed → Published (approve),
/// Proposed → Draft (reject). Published is terminal.
pub fn validate_transition(name: &str, from: Lifecycle, to: Lifecycle) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (Lifecycle::Draft, Lifecycle::Proposed)
            | (Lifecycle::Proposed, Lifecycle::Published | Lifecycle::Draft)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            name: name.to_owned(),
            from,
            to,
        })
    }
}

/// Content may only change while a revision is a Draft.
pub fn require_draft(name: &str, lifecycle: Lifecycle) -> Result<(), CoreError> {
    if lifecycle == Lifecycle::Draft {
        Ok(())
    } else {
        Err(CoreError::NotDraft {
            name: name.to_owned(),
            lifecycle,
        })
    }
}
