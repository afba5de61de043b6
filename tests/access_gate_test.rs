//! Access gate over the full fact space.

use carepay::access::{AccessGate, AccessPaths, Destination, GATE_RULES, UserAccessFacts, decide, evaluate};

fn all_facts() -> impl Iterator<Item = UserAccessFacts> {
    (0u8..32).map(|bits| UserAccessFacts {
        authenticated: bits & 1 != 0,
        profile_loaded: bits & 2 != 0,
        onboarding_completed: bits & 4 != 0,
        has_active_subscription: bits & 8 != 0,
        health_assessment_completed: bits & 16 != 0,
    })
}

/// The precedence order written out long-hand.
fn expected(f: &UserAccessFacts) -> Destination {
    if !f.authenticated {
        Destination::Landing
    } else if !f.profile_loaded {
        Destination::Wait
    } else if !f.onboarding_completed {
        Destination::Onboarding
    } else if f.has_active_subscription {
        Destination::Proceed
    } else if !f.health_assessment_completed {
        Destination::HealthAssessment
    } else {
        Destination::Paywall
    }
}

#[test]
fn every_fact_combination_has_exactly_one_destination() {
    let mut seen = 0;
    for facts in all_facts() {
        let decision = decide(&facts, "/dashboard");
        assert_eq!(decision.destination, expected(&facts), "facts: {:?}", facts);
        assert_eq!(evaluate(&facts).0, decision.destination);
        seen += 1;
    }
    assert_eq!(seen, 32);
}

#[test]
fn decisions_are_pure() {
    let gate = AccessGate::default();
    for facts in all_facts() {
        for path in ["/", "/dashboard", "/paywall", "/onboarding/step-2", "/legal?tab=terms"] {
            assert_eq!(gate.decide(&facts, path), gate.decide(&facts, path));
        }
    }
}

#[test]
fn following_a_redirect_never_redirects_again() {
    let gate = AccessGate::default();
    for facts in all_facts() {
        let first = gate.decide(&facts, "/dashboard");
        if let Some(target) = first.redirect {
            let second = gate.decide(&facts, &target);
            assert_eq!(second.destination, first.destination);
            assert_eq!(second.redirect, None, "facts: {:?} target: {}", facts, target);
        }
    }
}

#[test]
fn onboarding_outranks_subscription() {
    let facts = UserAccessFacts {
        authenticated: true,
        profile_loaded: true,
        onboarding_completed: false,
        has_active_subscription: true,
        health_assessment_completed: true,
    };
    let decision = decide(&facts, "/dashboard");
    assert_eq!(decision.destination, Destination::Onboarding);
    assert_eq!(decision.redirect.as_deref(), Some("/onboarding"));
}

#[test]
fn waiting_and_proceeding_stay_put() {
    for facts in all_facts() {
        let decision = decide(&facts, "/anything");
        if matches!(decision.destination, Destination::Wait | Destination::Proceed) {
            assert_eq!(decision.redirect, None);
        }
    }
}

#[test]
fn custom_paths_are_used_for_redirects() {
    let gate = AccessGate::new(AccessPaths {
        paywall: "/pricing".to_string(),
        paywall_allowed: vec!["/pricing".to_string(), "/billing".to_string()],
        ..AccessPaths::default()
    });
    let unpaid = UserAccessFacts {
        authenticated: true,
        profile_loaded: true,
        onboarding_completed: true,
        has_active_subscription: false,
        health_assessment_completed: true,
    };
    assert_eq!(gate.decide(&unpaid, "/dashboard").redirect.as_deref(), Some("/pricing"));
    assert_eq!(gate.decide(&unpaid, "/billing/checkout").redirect, None);
    assert_eq!(gate.rules().len(), GATE_RULES.len());
}
