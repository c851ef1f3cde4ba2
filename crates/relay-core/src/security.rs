use dashmap::DashSet;

use crate::domain::UserId;

// ============== Authorization ==============

pub fn is_allow_listed(user_id: UserId, allowed_users: &[i64]) -> bool {
    allowed_users.contains(&user_id.0)
}

/// Outcome of an access check for an inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Granted,
    /// The message was the correct passcode; the user is now authenticated.
    JustAuthenticated,
    /// A passcode is required and this message was not it.
    PasscodeRequired,
    Denied,
}

/// Who may use the relay.
///
/// - an allow-list (if non-empty) is a hard gate;
/// - a passcode (if set) must be sent once per process lifetime;
/// - with neither configured, everyone is allowed.
#[derive(Debug)]
pub struct AccessPolicy {
    allowed_users: Vec<i64>,
    passcode: Option<String>,
    authenticated: DashSet<UserId>,
}

impl AccessPolicy {
    pub fn new(allowed_users: Vec<i64>, passcode: Option<String>) -> Self {
        Self {
            allowed_users,
            passcode: passcode.filter(|p| !p.trim().is_empty()),
            authenticated: DashSet::new(),
        }
    }

    /// Check without side effects (commands, callbacks).
    pub fn is_authorized(&self, user_id: UserId) -> bool {
        if !self.allowed_users.is_empty() && !is_allow_listed(user_id, &self.allowed_users) {
            return false;
        }
        self.passcode.is_none() || self.authenticated.contains(&user_id)
    }

    /// Check an inbound text message, treating it as a passcode attempt when needed.
    pub fn check_message(&self, user_id: UserId, text: &str) -> Access {
        if !self.allowed_users.is_empty() && !is_allow_listed(user_id, &self.allowed_users) {
            return Access::Denied;
        }
        let Some(passcode) = &self.passcode else {
            return Access::Granted;
        };
        if self.authenticated.contains(&user_id) {
            return Access::Granted;
        }
        if text.trim() == passcode {
            self.authenticated.insert(user_id);
            return Access::JustAuthenticated;
        }
        Access::PasscodeRequired
    }
}
