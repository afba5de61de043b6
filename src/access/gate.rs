//! Navigation gate.
//!
//! Maps a user's [`UserAccessFacts`] and the path they are on to a single
//! [`RouteDecision`]. The precedence order lives in [`GATE_RULES`]; each row
//! names one fact and what to do when it holds or does not hold. The first
//! row that stops evaluation decides.
//!
//! | # | fact                        | unmet            | met     |
//! |---|-----------------------------|------------------|---------|
//! | 1 | authenticated               | landing          | next    |
//! | 2 | profile_loaded              | wait             | next    |
//! | 3 | onboarding_completed        | onboarding       | next    |
//! | 4 | has_active_subscription     | next             | proceed |
//! | 5 | health_assessment_completed | health assessment| next    |
//! |   | (end of table)              | paywall          |         |

use serde::{Deserialize, Serialize};

/// Everything the gate needs to know about a user, read fresh per decision.
///
/// Missing fields deserialize as `false`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserAccessFacts {
    pub authenticated: bool,
    pub profile_loaded: bool,
    pub onboarding_completed: bool,
    pub has_active_subscription: bool,
    pub health_assessment_completed: bool,
}

impl UserAccessFacts {
    /// Facts for a signed-in user with nothing else known yet.
    #[must_use]
    pub fn authenticated() -> Self {
        Self {
            authenticated: true,
            ..Self::default()
        }
    }

    fn holds(&self, fact: Fact) -> bool {
        match fact {
            Fact::Authenticated => self.authenticated,
            Fact::ProfileLoaded => self.profile_loaded,
            Fact::OnboardingCompleted => self.onboarding_completed,
            Fact::HasActiveSubscription => self.has_active_subscription,
            Fact::HealthAssessmentCompleted => self.health_assessment_completed,
        }
    }
}

/// One of the boolean facts the gate inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Fact {
    Authenticated,
    ProfileLoaded,
    OnboardingCompleted,
    HasActiveSubscription,
    HealthAssessmentCompleted,
}

/// Where the user belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Landing,
    /// Facts are still loading; stay put.
    Wait,
    Onboarding,
    HealthAssessment,
    Paywall,
    /// Full access; stay put.
    Proceed,
}

/// What a table row does for one value of its fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Evaluate the next row.
    Next,
    /// Stop here.
    Route(Destination, &'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateRule {
    pub fact: Fact,
    pub when_met: Step,
    pub when_unmet: Step,
}

/// Precedence order. Earlier rows are preconditions for later ones.
pub const GATE_RULES: [GateRule; 5] = [
    GateRule {
        fact: Fact::Authenticated,
        when_met: Step::Next,
        when_unmet: Step::Route(Destination::Landing, "not signed in"),
    },
    GateRule {
        fact: Fact::ProfileLoaded,
        when_met: Step::Next,
        when_unmet: Step::Route(Destination::Wait, "profile not loaded yet"),
    },
    GateRule {
        fact: Fact::OnboardingCompleted,
        when_met: Step::Next,
        when_unmet: Step::Route(Destination::Onboarding, "onboarding not completed"),
    },
    GateRule {
        fact: Fact::HasActiveSubscription,
        when_met: Step::Route(Destination::Proceed, "active subscription"),
        when_unmet: Step::Next,
    },
    GateRule {
        fact: Fact::HealthAssessmentCompleted,
        when_met: Step::Next,
        when_unmet: Step::Route(Destination::HealthAssessment, "health assessment not completed"),
    },
];

const END_OF_TABLE: (Destination, &str) = (Destination::Paywall, "subscription required");

/// The routing outcome for one navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteDecision {
    pub destination: Destination,
    /// Path to navigate to, or `None` to stay on the current page.
    pub redirect: Option<String>,
    pub reason: &'static str,
}

/// Paths the gate redirects to and the pages it leaves alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPaths {
    #[serde(default = "default_landing")]
    pub landing: String,
    #[serde(default = "default_onboarding")]
    pub onboarding: String,
    #[serde(default = "default_health_assessment")]
    pub health_assessment: String,
    #[serde(default = "default_paywall")]
    pub paywall: String,
    /// Reachable without signing in.
    #[serde(default = "default_public")]
    pub public: Vec<String>,
    /// Reachable by a signed-in user who still needs to pay.
    #[serde(default = "default_paywall_allowed")]
    pub paywall_allowed: Vec<String>,
}

fn default_landing() -> String {
    "/".to_string()
}

fn default_onboarding() -> String {
    "/onboarding".to_string()
}

fn default_health_assessment() -> String {
    "/health-assessment".to_string()
}

fn default_paywall() -> String {
    "/paywall".to_string()
}

fn default_public() -> Vec<String> {
    ["/", "/login", "/signup", "/legal"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_paywall_allowed() -> Vec<String> {
    ["/paywall", "/payment", "/legal", "/profile"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for AccessPaths {
    fn default() -> Self {
        Self {
            landing: default_landing(),
            onboarding: default_onboarding(),
            health_assessment: default_health_assessment(),
            paywall: default_paywall(),
            public: default_public(),
            paywall_allowed: default_paywall_allowed(),
        }
    }
}

impl AccessPaths {
    /// Load overrides from `CAREPAY_ACCESS_*`. List variables are comma-separated.
    pub fn from_env() -> Self {
        use crate::utils::get_env_with_prefix;

        let mut paths = Self::default();
        if let Some(v) = get_env_with_prefix("ACCESS_LANDING_PATH") {
            paths.landing = v;
        }
        if let Some(v) = get_env_with_prefix("ACCESS_ONBOARDING_PATH") {
            paths.onboarding = v;
        }
        if let Some(v) = get_env_with_prefix("ACCESS_HEALTH_ASSESSMENT_PATH") {
            paths.health_assessment = v;
        }
        if let Some(v) = get_env_with_prefix("ACCESS_PAYWALL_PATH") {
            paths.paywall = v;
        }
        if let Some(v) = get_env_with_prefix("ACCESS_PUBLIC_PATHS") {
            paths.public = split_list(&v);
        }
        if let Some(v) = get_env_with_prefix("ACCESS_PAYWALL_ALLOWED_PATHS") {
            paths.paywall_allowed = split_list(&v);
        }
        paths
    }

    /// Every configured path must be absolute.
    pub fn validate(&self) -> Result<(), String> {
        let singles = [
            ("landing", &self.landing),
            ("onboarding", &self.onboarding),
            ("health_assessment", &self.health_assessment),
            ("paywall", &self.paywall),
        ];
        for (name, path) in singles {
            if !path.starts_with('/') {
                return Err(format!("access path '{}' must start with '/', got '{}'", name, path));
            }
        }
        for path in self.public.iter().chain(&self.paywall_allowed) {
            if !path.starts_with('/') {
                return Err(format!("allowed path '{}' must start with '/'", path));
            }
        }
        Ok(())
    }

    fn target(&self, destination: Destination) -> Option<&str> {
        match destination {
            Destination::Landing => Some(&self.landing),
            Destination::Onboarding => Some(&self.onboarding),
            Destination::HealthAssessment => Some(&self.health_assessment),
            Destination::Paywall => Some(&self.paywall),
            Destination::Wait | Destination::Proceed => None,
        }
    }

    /// Pages where `destination` does not force a redirect.
    fn tolerated(&self, destination: Destination) -> &[String] {
        match destination {
            Destination::Landing => &self.public,
            Destination::Paywall => &self.paywall_allowed,
            _ => &[],
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// `path` is `prefix` or below it. `/` matches only itself.
fn path_matches(path: &str, prefix: &str) -> bool {
    let path = strip_query(path);
    if prefix == "/" {
        return path == "/";
    }
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn strip_query(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    match &path[..end] {
        "" => "/",
        p => p,
    }
}

/// Walk [`GATE_RULES`] for `facts`.
#[must_use]
pub fn evaluate(facts: &UserAccessFacts) -> (Destination, &'static str) {
    for rule in &GATE_RULES {
        let step = if facts.holds(rule.fact) {
            rule.when_met
        } else {
            rule.when_unmet
        };
        if let Step::Route(destination, reason) = step {
            return (destination, reason);
        }
    }
    END_OF_TABLE
}

/// Stateless gate over a set of [`AccessPaths`].
#[derive(Debug, Clone, Default)]
pub struct AccessGate {
    paths: AccessPaths,
}

impl AccessGate {
    pub fn new(paths: AccessPaths) -> Self {
        Self { paths }
    }

    #[must_use]
    pub fn paths(&self) -> &AccessPaths {
        &self.paths
    }

    /// The precedence table this gate evaluates.
    #[must_use]
    pub fn rules(&self) -> &'static [GateRule] {
        &GATE_RULES
    }

    /// Decide where a user on `current_path` should be.
    ///
    /// Pure: the same facts and path always give the same decision. A user
    /// already on the destination page (or a page tolerated for it) is never
    /// redirected.
    #[must_use]
    pub fn decide(&self, facts: &UserAccessFacts, current_path: &str) -> RouteDecision {
        let (destination, reason) = evaluate(facts);

        let redirect = self.paths.target(destination).and_then(|target| {
            let already_there = path_matches(current_path, target)
                || self
                    .paths
                    .tolerated(destination)
                    .iter()
                    .any(|allowed| path_matches(current_path, allowed));
            (!already_there).then(|| target.to_string())
        });

        RouteDecision {
            destination,
            redirect,
            reason,
        }
    }
}

/// [`AccessGate::decide`] with the default paths.
#[must_use]
pub fn decide(facts: &UserAccessFacts, current_path: &str) -> RouteDecision {
    AccessGate::default().decide(facts, current_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(auth: bool, loaded: bool, onboarded: bool, subscribed: bool, assessed: bool) -> UserAccessFacts {
        UserAccessFacts {
            authenticated: auth,
            profile_loaded: loaded,
            onboarding_completed: onboarded,
            has_active_subscription: subscribed,
            health_assessment_completed: assessed,
        }
    }

    #[test]
    fn unauthenticated_goes_to_landing() {
        let d = decide(&facts(false, true, true, true, true), "/dashboard");
        assert_eq!(d.destination, Destination::Landing);
        assert_eq!(d.redirect.as_deref(), Some("/"));
    }

    #[test]
    fn unauthenticated_on_public_page_stays() {
        let gate = AccessGate::default();
        assert_eq!(gate.decide(&UserAccessFacts::default(), "/login").redirect, None);
        assert_eq!(gate.decide(&UserAccessFacts::default(), "/").redirect, None);
        assert_eq!(gate.decide(&UserAccessFacts::default(), "/legal/terms").redirect, None);
    }

    #[test]
    fn loading_profile_waits() {
        let d = decide(&UserAccessFacts::authenticated(), "/dashboard");
        assert_eq!(d.destination, Destination::Wait);
        assert_eq!(d.redirect, None);
    }

    #[test]
    fn onboarding_precedes_subscription_and_assessment() {
        for subscribed in [false, true] {
            for assessed in [false, true] {
                let d = decide(&facts(true, true, false, subscribed, assessed), "/dashboard");
                assert_eq!(d.destination, Destination::Onboarding);
                assert_eq!(d.redirect.as_deref(), Some("/onboarding"));
            }
        }
    }

    #[test]
    fn subscriber_proceeds_without_assessment() {
        let d = decide(&facts(true, true, true, true, false), "/dashboard");
        assert_eq!(d.destination, Destination::Proceed);
        assert_eq!(d.redirect, None);
    }

    #[test]
    fn unpaid_user_needs_assessment_first() {
        let d = decide(&facts(true, true, true, false, false), "/dashboard");
        assert_eq!(d.destination, Destination::HealthAssessment);
        assert_eq!(d.redirect.as_deref(), Some("/health-assessment"));
    }

    #[test]
    fn assessed_unpaid_user_hits_paywall_unless_allowed() {
        let f = facts(true, true, true, false, true);
        let d = decide(&f, "/dashboard");
        assert_eq!(d.destination, Destination::Paywall);
        assert_eq!(d.redirect.as_deref(), Some("/paywall"));

        assert_eq!(decide(&f, "/payment/success?orderId=MT1").redirect, None);
        assert_eq!(decide(&f, "/profile").redirect, None);
    }

    #[test]
    fn never_redirects_to_current_page() {
        let f = facts(true, true, false, false, false);
        assert_eq!(decide(&f, "/onboarding").redirect, None);
        assert_eq!(decide(&f, "/onboarding/step-2").redirect, None);
        assert_eq!(decide(&f, "/onboarding?resume=1").redirect, None);
    }

    #[test]
    fn prefix_match_respects_segments() {
        assert!(path_matches("/payment", "/payment"));
        assert!(path_matches("/payment/", "/payment"));
        assert!(path_matches("/payment/phonepe/success", "/payment/"));
        assert!(!path_matches("/payments-admin", "/payment"));
        assert!(!path_matches("/dashboard", "/"));
        assert!(path_matches("?x=1", "/"));
    }

    #[test]
    fn custom_paths() {
        let gate = AccessGate::new(AccessPaths {
            paywall: "/pricing".to_string(),
            paywall_allowed: vec![],
            ..AccessPaths::default()
        });
        let d = gate.decide(&facts(true, true, true, false, true), "/payment");
        assert_eq!(d.redirect.as_deref(), Some("/pricing"));
    }

    #[test]
    fn rules_table_is_in_waterfall_order() {
        let order: Vec<Fact> = AccessGate::default().rules().iter().map(|r| r.fact).collect();
        assert_eq!(
            order,
            vec![
                Fact::Authenticated,
                Fact::ProfileLoaded,
                Fact::OnboardingCompleted,
                Fact::HasActiveSubscription,
                Fact::HealthAssessmentCompleted,
            ]
        );
    }

    #[test]
    fn path_validation() {
        assert!(AccessPaths::default().validate().is_ok());
        let bad = AccessPaths {
            onboarding: "onboarding".to_string(),
            ..AccessPaths::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn facts_deserialize_from_camel_case() {
        let f: UserAccessFacts = serde_json::from_str(
            r#"{"authenticated":true,"profileLoaded":true,"onboardingCompleted":true,
                "hasActiveSubscription":false,"healthAssessmentCompleted":true}"#,
        )
        .unwrap();
        assert_eq!(f, facts(true, true, true, false, true));
    }
}
