//! Identity & team resolver.
//!
//! The authentication layer is assumed to have already populated a request
//! context with either a *user* identity or a *team* identity; this module
//! only consumes that. Same shape as an `AgentIdentity` (API-key vs. JWT
//! identity, `is_authenticated`, role checks) generalized from "one agent,
//! one key" to "one caller, one or more teams".

use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::model::Team;
use crate::store::Store;

/// Claims extracted from a validated bearer token, scoped to what identity
/// resolution needs.
#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub user_id: Uuid,
}

/// Claims extracted from a validated API token, analogous to an
/// API-key-backed identity.
#[derive(Debug, Clone)]
pub struct TeamIdentity {
    pub team_id: Uuid,
}

/// Who is making this request. Exactly one of these is ever populated by
/// the (out-of-scope) auth layer -- modeled here as an enum rather than two
/// `Option` fields so illegal "both populated" / "neither populated" states
/// are unrepresentable.
#[derive(Debug, Clone)]
pub enum Identity {
    User(UserIdentity),
    Team(TeamIdentity),
    Anonymous,
}

/// Threaded through every handler instead of living in a thread-local or
/// other ambient global.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub identity: Identity,
    /// SDK user-agent string, consulted during build version negotiation.
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>, identity: Identity) -> Self {
        Self {
            trace_id: trace_id.into(),
            identity,
            user_agent: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn for_team(trace_id: impl Into<String>, team_id: Uuid) -> Self {
        Self::new(trace_id, Identity::Team(TeamIdentity { team_id }))
    }

    pub fn for_user(trace_id: impl Into<String>, user_id: Uuid) -> Self {
        Self::new(trace_id, Identity::User(UserIdentity { user_id }))
    }
}

/// Resolves the team a caller is acting on behalf of.
///
/// - Team-auth callers get their own team back directly.
/// - User-auth callers resolve against their team memberships: an explicit
///   `team_id` must be a team they belong to (404-as-Forbidden otherwise);
///   with no explicit id, the user's default team is used.
/// - No identity at all is a 401, not a 403 -- the caller never authenticated.
pub async fn get_team(
    store: &dyn Store,
    ctx: &RequestContext,
    requested_team_id: Option<Uuid>,
) -> ApiResult<Team> {
    match &ctx.identity {
        Identity::Team(t) => {
            if let Some(requested) = requested_team_id
                && requested != t.team_id
            {
                return Err(ApiError::forbidden("token is scoped to a different team"));
            }
            store.get_team(t.team_id).await
        }
        Identity::User(u) => {
            let memberships = store.list_user_teams(u.user_id).await?;
            if memberships.is_empty() {
                return Err(ApiError::forbidden("user has no teams"));
            }
            match requested_team_id {
                Some(requested) => memberships
                    .into_iter()
                    .find(|t| t.id == requested)
                    .ok_or_else(|| ApiError::forbidden("not a member of the requested team")),
                None => store
                    .default_team_for_user(u.user_id)
                    .await?
                    .ok_or_else(|| ApiError::forbidden("no default team and none specified")),
            }
        }
        Identity::Anonymous => Err(ApiError::unauthenticated("no credentials provided")),
    }
}

/// Whether `entity_team` belongs to the caller, enforcing the ownership
/// invariant (`entity.teamID == caller.teamID`). Team tokens must match
/// exactly; user tokens must be a member of the entity's team.
pub async fn assert_owns_team(
    store: &dyn Store,
    ctx: &RequestContext,
    entity_team_id: Uuid,
) -> ApiResult<()> {
    match &ctx.identity {
        Identity::Team(t) if t.team_id == entity_team_id => Ok(()),
        Identity::Team(_) => Err(ApiError::forbidden("team does not own this resource")),
        Identity::User(u) => {
            let memberships = store.list_user_teams(u.user_id).await?;
            if memberships.iter().any(|t| t.id == entity_team_id) {
                Ok(())
            } else {
                // Indistinguishable from absent, matching the alias lookup rule.
                Err(ApiError::not_found("resource not found"))
            }
        }
        Identity::Anonymous => Err(ApiError::unauthenticated("no credentials provided")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn team_identity_returns_its_own_team_directly() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let ctx = RequestContext::for_team("t1", team.id);

        let got = get_team(&store, &ctx, None).await.unwrap();
        assert_eq!(got.id, team.id);
    }

    #[tokio::test]
    async fn team_identity_rejects_mismatched_explicit_team() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let other = store.seed_team("other").await;
        let ctx = RequestContext::for_team("t1", team.id);

        let err = get_team(&store, &ctx, Some(other.id)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn user_identity_falls_back_to_default_team() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let user = store.seed_user_in_team(team.id, true).await;
        let ctx = RequestContext::for_user("t1", user);

        let got = get_team(&store, &ctx, None).await.unwrap();
        assert_eq!(got.id, team.id);
    }

    #[tokio::test]
    async fn user_identity_without_default_and_no_explicit_team_fails() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let user = store.seed_user_in_team(team.id, false).await;
        let ctx = RequestContext::for_user("t1", user);

        let err = get_team(&store, &ctx, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn user_not_member_of_requested_team_is_forbidden() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let other = store.seed_team("other").await;
        let user = store.seed_user_in_team(team.id, true).await;
        let ctx = RequestContext::for_user("t1", user);

        let err = get_team(&store, &ctx, Some(other.id)).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn anonymous_identity_is_unauthenticated() {
        let store = InMemoryStore::new();
        let ctx = RequestContext::new("t1", Identity::Anonymous);
        let err = get_team(&store, &ctx, None).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Unauthenticated);
    }

    #[tokio::test]
    async fn assert_owns_team_hides_foreign_teams_as_not_found() {
        let store = InMemoryStore::new();
        let team = store.seed_team("acme").await;
        let other = store.seed_team("other").await;
        let user = store.seed_user_in_team(team.id, true).await;
        let ctx = RequestContext::for_user("t1", user);

        let err = assert_owns_team(&store, &ctx, other.id).await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }
}
