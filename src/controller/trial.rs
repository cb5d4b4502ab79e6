use std::time::Duration;

use crate::session::Access;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialVerdict {
    Continue,
    /// Anonymous trial is over; ask the user to sign up.
    PromptRegistration,
    /// Free tier is over; ask the user to upgrade.
    PromptUpgrade,
}

pub fn evaluate(access: Access, elapsed_secs: u64, ceiling: Duration) -> TrialVerdict {
    if access.has_paid_access() || elapsed_secs < ceiling.as_secs() {
        return TrialVerdict::Continue;
    }
    if access.is_authenticated() {
        TrialVerdict::PromptUpgrade
    } else {
        TrialVerdict::PromptRegistration
    }
}
