use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

pub const AUTHENTICATED: &str = "secrets.infisical.com/Authenticated";
pub const READY_TO_SYNC: &str = "secrets.infisical.com/ReadyToSyncSecrets";
pub const AUTO_REDEPLOY_READY: &str = "secrets.infisical.com/AutoRedeployReady";

pub const FAILED_TO_CREATE: &str = "secrets.infisical.com/FailedToCreateSecrets";
pub const FAILED_TO_UPDATE: &str = "secrets.infisical.com/FailedToUpdateSecrets";
pub const FAILED_TO_DELETE: &str = "secrets.infisical.com/FailedToDeleteSecrets";
pub const FAILED_TO_REPLACE: &str = "secrets.infisical.com/FailedToReplaceSecrets";

pub const LEASE_CREATED: &str = "secrets.infisical.com/LeaseCreated";
pub const LEASE_RENEWED: &str = "secrets.infisical.com/LeaseRenewed";

/// Desired state of a single condition, before bookkeeping fields are filled in
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConditionUpdate {
    pub type_: &'static str,
    pub status: bool,
    pub reason: String,
    pub message: String,
}

impl ConditionUpdate {
    pub fn new(
        type_: &'static str,
        status: bool,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_,
            status,
            reason: reason.into(),
            message: message.into(),
        }
    }

    pub fn ok(type_: &'static str, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, true, reason, message)
    }

    pub fn failed(type_: &'static str, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, false, reason, message)
    }
}

fn status_string(status: bool) -> &'static str {
    if status {
        "True"
    } else {
        "False"
    }
}

/// Upsert a condition.
///
/// The transition time only moves when the status flips. Returns whether anything changed,
/// so callers can skip writing an unchanged status.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    update: ConditionUpdate,
    generation: Option<i64>,
) -> bool {
    let status = status_string(update.status);
    match conditions.iter_mut().find(|c| c.type_ == update.type_) {
        Some(existing) => {
            let unchanged = existing.status == status
                && existing.reason == update.reason
                && existing.message == update.message
                && existing.observed_generation == generation;
            if unchanged {
                return false;
            }

            if existing.status != status {
                existing.last_transition_time = Time(Utc::now());
            }
            existing.status = status.into();
            existing.reason = update.reason;
            existing.message = update.message;
            existing.observed_generation = generation;
            true
        }
        None => {
            conditions.push(Condition {
                type_: update.type_.into(),
                status: status.into(),
                reason: update.reason,
                message: update.message,
                observed_generation: generation,
                last_transition_time: Time(Utc::now()),
            });
            true
        }
    }
}

/// Apply several updates, returning whether any of them changed the list
pub fn set_conditions(
    conditions: &mut Vec<Condition>,
    updates: impl IntoIterator<Item = ConditionUpdate>,
    generation: Option<i64>,
) -> bool {
    updates
        .into_iter()
        .fold(false, |changed, update| {
            set_condition(conditions, update, generation) | changed
        })
}

pub fn find<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Condition reporting a set of keys a push operation failed for
pub fn failed_keys(type_: &'static str, action: &str, keys: &[String]) -> ConditionUpdate {
    if keys.is_empty() {
        ConditionUpdate::failed(type_, "NoErrors", format!("No secrets failed to {action}"))
    } else {
        ConditionUpdate::ok(
            type_,
            "Failed",
            format!("Failed to {action} secrets: [{}]", keys.join(", ")),
        )
    }
}
