//! Reading [`UserAccessFacts`] from the stores.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::gate::UserAccessFacts;
use crate::error::Result;
use crate::payments::SubscriptionLedger;

const TARGET: &str = "carepay::access";

/// The user's main profile row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub onboarding_completed: bool,
    pub health_assessment_completed: bool,
}

/// Row written by the onboarding flow, consulted when no profile exists yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnboardingProfile {
    pub user_id: String,
    pub onboarding_completed: bool,
}

/// Read access to profile tables.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn get_onboarding_profile(&self, user_id: &str) -> Result<Option<OnboardingProfile>>;
}

/// In-memory profile tables.
#[derive(Clone, Default)]
pub struct InMemoryProfileStore {
    profiles: Arc<RwLock<HashMap<String, UserProfile>>>,
    onboarding: Arc<RwLock<HashMap<String, OnboardingProfile>>>,
}

impl InMemoryProfileStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_profile(&self, profile: UserProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }

    pub async fn upsert_onboarding_profile(&self, profile: OnboardingProfile) {
        self.onboarding
            .write()
            .await
            .insert(profile.user_id.clone(), profile);
    }
}

#[async_trait]
impl ProfileStore for InMemoryProfileStore {
    async fn get_user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.profiles.read().await.get(user_id).cloned())
    }

    async fn get_onboarding_profile(&self, user_id: &str) -> Result<Option<OnboardingProfile>> {
        Ok(self.onboarding.read().await.get(user_id).cloned())
    }
}

/// Builds [`UserAccessFacts`] for one navigation decision.
///
/// Nothing is cached; every call reads the profile tables and asks the
/// ledger once for the active subscription. If any read fails the facts
/// report the profile as not loaded, so the gate waits instead of guessing.
#[derive(Clone)]
pub struct AccessFactsResolver {
    profiles: Arc<dyn ProfileStore>,
    ledger: SubscriptionLedger,
}

impl AccessFactsResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>, ledger: SubscriptionLedger) -> Self {
        Self { profiles, ledger }
    }

    /// Facts for `user_id`, or for an anonymous visitor when `None`.
    pub async fn resolve(&self, user_id: Option<&str>) -> UserAccessFacts {
        let Some(user_id) = user_id else {
            return UserAccessFacts::default();
        };

        match self.load(user_id).await {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!(
                    target: TARGET,
                    user_id,
                    error = %e,
                    "Could not read access facts; treating profile as not loaded"
                );
                UserAccessFacts::authenticated()
            }
        }
    }

    async fn load(&self, user_id: &str) -> Result<UserAccessFacts> {
        let profile = self.profiles.get_user_profile(user_id).await?;

        let onboarding_completed = match &profile {
            Some(p) => p.onboarding_completed,
            None => self
                .profiles
                .get_onboarding_profile(user_id)
                .await?
                .is_some_and(|o| o.onboarding_completed),
        };

        let has_active_subscription = self.ledger.get_active(user_id).await?.is_some();

        Ok(UserAccessFacts {
            authenticated: true,
            profile_loaded: true,
            onboarding_completed,
            has_active_subscription,
            health_assessment_completed: profile.is_some_and(|p| p.health_assessment_completed),
        })
    }
}
