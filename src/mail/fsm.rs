//! Recipient state machine.
//!
//! Transitions mutate only the recipient envelope, never the message row.
//! The table is closed: anything not listed here is a domain error.

use crate::error::MailError;
use crate::models::MessageState;

use MessageState::*;

/// Whether `from -> to` is a legal transition. Self-transitions are illegal
/// except snoozed -> snoozed, which refreshes the wake time.
pub fn allowed(from: MessageState, to: MessageState) -> bool {
    match (from, to) {
        (Snoozed, Snoozed) => true,
        (a, b) if a == b => false,
        // Trash permits neither starring nor snoozing; restore first.
        (Trash, Starred) | (Trash, Snoozed) => false,
        _ => true,
    }
}

/// Validate a transition and describe the row updates it implies.
pub fn step(
    from: MessageState,
    to: MessageState,
    snoozed_until: Option<i64>,
    now: i64,
) -> Result<Effects, MailError> {
    if !allowed(from, to) {
        return Err(MailError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }
    let mut fx = Effects::new(to);
    match to {
        Unread => {
            // Only an explicit mark-unread clears the read timestamp;
            // unarchive, wake and restore land here with read_at intact.
            if from == Read {
                fx.clear_read_at = true;
            }
            fx.clear_snooze = true;
            fx.set_archived = Some(false);
        }
        Read => {
            fx.set_read_at_if_null = true;
            fx.clear_snooze = true;
            fx.set_archived = Some(false);
            if from == Starred {
                fx.set_starred = Some(false);
            }
        }
        Starred => {
            // Starring implies the message was seen.
            fx.set_starred = Some(true);
            fx.set_read_at_if_null = true;
            fx.clear_snooze = true;
            fx.set_archived = Some(false);
        }
        Snoozed => {
            let until = snoozed_until.ok_or_else(|| {
                MailError::InvalidArgument("snoozed_until is required to snooze".into())
            })?;
            if until <= now {
                return Err(MailError::InvalidArgument(
                    "snoozed_until must be in the future".into(),
                ));
            }
            fx.set_snoozed_until = Some(until);
            fx.set_archived = Some(false);
        }
        Archived => {
            fx.set_archived = Some(true);
            fx.clear_snooze = true;
        }
        Trash => {
            fx.clear_snooze = true;
        }
    }
    Ok(fx)
}

/// Row updates implied by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effects {
    pub new_state: MessageState,
    pub set_read_at_if_null: bool,
    pub clear_read_at: bool,
    pub set_starred: Option<bool>,
    pub set_archived: Option<bool>,
    pub set_snoozed_until: Option<i64>,
    pub clear_snooze: bool,
}

impl Effects {
    fn new(new_state: MessageState) -> Effects {
        Effects {
            new_state,
            set_read_at_if_null: false,
            clear_read_at: false,
            set_starred: None,
            set_archived: None,
            set_snoozed_until: None,
            clear_snooze: false,
        }
    }
}
