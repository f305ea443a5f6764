//! Route tokens: a handler's declared next step for one job.
//!
//! A token is scoped to the watcher session that issued it and to the job it
//! was issued for. A watcher honors a token only when both match its own
//! dispatch; anything else is treated as a no-op.

use crate::id::{ChannelName, JobId, SessionId};

/// What should happen to the job after the handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteAction {
    /// Move the job to another channel.
    Advance(ChannelName),
    /// Drop the job: remove its record and log a delete command.
    Delete,
}

/// Capability-scoped routing decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteToken {
    job_id: JobId,
    action: RouteAction,
    session: SessionId,
}

impl RouteToken {
    pub fn new(job_id: JobId, action: RouteAction, session: SessionId) -> Self {
        Self {
            job_id,
            action,
            session,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn action(&self) -> &RouteAction {
        &self.action
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    /// Whether this token may be applied to `job_id` by `session`.
    pub fn is_issued_for(&self, job_id: &JobId, session: &SessionId) -> bool {
        &self.session == session && &self.job_id == job_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_scoped_to_session_and_job() {
        let session = SessionId::new();
        let job = JobId::new("j1").unwrap();
        let token = RouteToken::new(job.clone(), RouteAction::Delete, session.clone());

        assert!(token.is_issued_for(&job, &session));
        assert!(!token.is_issued_for(&job, &SessionId::new()));
        assert!(!token.is_issued_for(&JobId::new("j2").unwrap(), &session));
    }
}
