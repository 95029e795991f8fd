//! Identity resolution: role to user lookups.
//!
//! The identity service is an unreliable external dependency. Step building
//! goes through [`resolve_assignees`], which degrades any failure to an empty
//! result so a step is left unassigned instead of failing submission.

use async_trait::async_trait;
use std::collections::HashMap;

/// Failure reported by an identity backend.
#[derive(Debug, thiserror::Error)]
#[error("Identity lookup failed: {message}")]
pub struct IdentityError {
    pub message: String,
}

impl IdentityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Role/user resolution consumed by the engine.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Users holding `role` within `entity_id`. May be empty.
    async fn users_with_role(&self, entity_id: &str, role: &str)
        -> Result<Vec<String>, IdentityError>;

    /// Roles held by `user_id` within `entity_id`.
    async fn user_roles(&self, entity_id: &str, user_id: &str)
        -> Result<Vec<String>, IdentityError>;
}

/// Look up users for a role, logging and swallowing failures.
pub async fn resolve_assignees(
    resolver: &dyn IdentityResolver,
    entity_id: &str,
    role: &str,
) -> Vec<String> {
    match resolver.users_with_role(entity_id, role).await {
        Ok(users) => users,
        Err(e) => {
            tracing::warn!(
                entity_id,
                role,
                error = %e,
                "Could not fetch users for role; step will be unassigned"
            );
            Vec::new()
        }
    }
}

/// Look up a user's roles, logging and swallowing failures.
pub async fn resolve_roles(
    resolver: &dyn IdentityResolver,
    entity_id: &str,
    user_id: &str,
) -> Option<Vec<String>> {
    match resolver.user_roles(entity_id, user_id).await {
        Ok(roles) => Some(roles),
        Err(e) => {
            tracing::warn!(entity_id, user_id, error = %e, "Could not fetch roles for user");
            None
        }
    }
}

/// Fixed role membership, identical for every entity.
///
/// Backs the CLI (seeded from configuration) and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityResolver {
    roles: HashMap<String, Vec<String>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a role -> users map.
    pub fn from_roles(roles: HashMap<String, Vec<String>>) -> Self {
        Self { roles }
    }

    /// Grant `role` to `user`. Insertion order is preserved per role.
    pub fn with_member(mut self, role: impl Into<String>, user: impl Into<String>) -> Self {
        let user = user.into();
        let members = self.roles.entry(role.into()).or_default();
        if !members.contains(&user) {
            members.push(user);
        }
        self
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn users_with_role(
        &self,
        _entity_id: &str,
        role: &str,
    ) -> Result<Vec<String>, IdentityError> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }

    async fn user_roles(&self, _entity_id: &str, user_id: &str) -> Result<Vec<String>, IdentityError> {
        let mut roles: Vec<String> = self
            .roles
            .iter()
            .filter(|(_, users)| users.iter().any(|u| u == user_id))
            .map(|(role, _)| role.clone())
            .collect();
        roles.sort();
        Ok(roles)
    }
}

/// Resolver that always fails. Models an unavailable identity service.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableIdentityResolver;

#[async_trait]
impl IdentityResolver for UnavailableIdentityResolver {
    async fn users_with_role(
        &self,
        _entity_id: &str,
        _role: &str,
    ) -> Result<Vec<String>, IdentityError> {
        Err(IdentityError::new("identity service unavailable"))
    }

    async fn user_roles(&self, _entity_id: &str, _user_id: &str) -> Result<Vec<String>, IdentityError> {
        Err(IdentityError::new("identity service unavailable"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_resolver_lookups() {
        let resolver = StaticIdentityResolver::new()
            .with_member("CLERK", "alice")
            .with_member("CLERK", "bob")
            .with_member("CFO", "bob");

        let clerks = resolver.users_with_role("ent", "CLERK").await.unwrap();
        assert_eq!(clerks, vec!["alice".to_string(), "bob".to_string()]);

        let roles = resolver.user_roles("ent", "bob").await.unwrap();
        assert_eq!(roles, vec!["CFO".to_string(), "CLERK".to_string()]);

        assert!(resolver.users_with_role("ent", "NONE").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_assignees_degrades_to_empty() {
        let users = resolve_assignees(&UnavailableIdentityResolver, "ent", "CLERK").await;
        assert!(users.is_empty());
        assert!(
            resolve_roles(&UnavailableIdentityResolver, "ent", "alice")
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_with_member_deduplicates() {
        let resolver = StaticIdentityResolver::new()
            .with_member("CLERK", "alice")
            .with_member("CLERK", "alice");
        assert_eq!(resolver.users_with_role("e", "CLERK").await.unwrap().len(), 1);
    }
}
