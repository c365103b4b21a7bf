/// Property-based tests using proptest
/// Tests invariants that should hold for all scoring inputs and id batches
use proptest::prelude::*;
use threat_intel_enrich::config::parse_priority;
use threat_intel_enrich::enrichment::prepare_ids;
use threat_intel_enrich::models::{normalize_entity_id, EntityKind, IntelPayload, Verdict};
use threat_intel_enrich::scoring::{
    correlation_confidence, detection_breakdown, detection_score, score_detection,
    CorrelationInputs, DetectionInputs, Severity,
};

fn any_f64() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        Just(None),
        Just(Some(f64::NAN)),
        Just(Some(f64::INFINITY)),
        Just(Some(f64::NEG_INFINITY)),
        any::<f64>().prop_map(Some),
        (0.0f64..=10.0).prop_map(Some),
    ]
}

fn detection_inputs() -> impl Strategy<Value = DetectionInputs> {
    (any_f64(), any_f64(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(cvss_score, epss_probability, known_exploited, malware_associated, active_threat)| {
            DetectionInputs {
                cvss_score,
                epss_probability,
                known_exploited,
                malware_associated,
                active_threat,
            }
        },
    )
}

fn verdict() -> impl Strategy<Value = Option<Verdict>> {
    prop_oneof![
        Just(None),
        Just(Some(Verdict::Malicious)),
        Just(Some(Verdict::Suspicious)),
        Just(Some(Verdict::Benign)),
        Just(Some(Verdict::Unknown)),
    ]
}

fn severity() -> impl Strategy<Value = Option<Severity>> {
    prop_oneof![
        Just(None),
        Just(Some(Severity::Low)),
        Just(Some(Severity::Medium)),
        Just(Some(Severity::High)),
        Just(Some(Severity::Critical)),
    ]
}

// Property: Detection score stays in range for any input
proptest! {
    #[test]
    fn detection_score_is_bounded(inputs in detection_inputs()) {
        let score = detection_score(&inputs);
        prop_assert!(score <= 100);
    }

    #[test]
    fn severity_matches_score_band(inputs in detection_inputs()) {
        let scored = score_detection(&inputs);
        prop_assert_eq!(scored.severity, Severity::from_score(scored.score));
        prop_assert_eq!(scored.score, detection_score(&inputs));
    }

    #[test]
    fn breakdown_total_is_sum_of_components(inputs in detection_inputs()) {
        let breakdown = detection_breakdown(&inputs);
        let sum: f64 = breakdown.components.iter().map(|c| c.points).sum();
        prop_assert_eq!(breakdown.components.len(), 4);
        prop_assert!((breakdown.raw_total - sum).abs() < 1e-9 || !sum.is_finite());
    }

    #[test]
    fn in_range_inputs_never_need_clamping(
        cvss in 0.0f64..=10.0,
        epss in 0.0f64..=1.0,
        kev in any::<bool>(),
        malware in any::<bool>(),
        active in any::<bool>()
    ) {
        let inputs = DetectionInputs {
            cvss_score: Some(cvss),
            epss_probability: Some(epss),
            known_exploited: kev,
            malware_associated: malware,
            active_threat: active,
        };
        let breakdown = detection_breakdown(&inputs);
        prop_assert!(breakdown.raw_total >= 0.0);
        prop_assert!(breakdown.raw_total <= 100.0 + 1e-9);
        prop_assert_eq!(detection_score(&inputs), breakdown.raw_total.trunc() as u8);
    }
}

// Property: Severity is monotonic in score
proptest! {
    #[test]
    fn severity_is_monotonic(a in any::<u8>(), b in any::<u8>()) {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(Severity::from_score(low) <= Severity::from_score(high));
    }

    #[test]
    fn raising_cvss_never_lowers_score(
        base in 0.0f64..=10.0,
        bump in 0.0f64..=10.0,
        kev in any::<bool>()
    ) {
        let lower = DetectionInputs {
            cvss_score: Some(base),
            known_exploited: kev,
            ..Default::default()
        };
        let higher = DetectionInputs {
            cvss_score: Some((base + bump).min(10.0)),
            ..lower
        };
        prop_assert!(detection_score(&lower) <= detection_score(&higher));
    }
}

// Property: Correlation confidence stays in range
proptest! {
    #[test]
    fn correlation_confidence_is_bounded(
        verdict in verdict(),
        confidence in any_f64(),
        hosts in any::<u32>(),
        elevated in any::<bool>(),
        severity in severity()
    ) {
        let inputs = CorrelationInputs {
            verdict,
            verdict_confidence: confidence.unwrap_or(0.0),
            propagated_hosts: hosts,
            elevated_risk: elevated,
            severity,
        };
        prop_assert!(correlation_confidence(&inputs) <= 100);
    }

    #[test]
    fn lateral_propagation_saturates(hosts in 5u32..) {
        let at_cap = CorrelationInputs {
            propagated_hosts: 5,
            ..Default::default()
        };
        let beyond = CorrelationInputs {
            propagated_hosts: hosts,
            ..Default::default()
        };
        prop_assert_eq!(correlation_confidence(&at_cap), correlation_confidence(&beyond));
    }
}

// Property: Batch preparation keeps order, drops duplicates and respects the cap
proptest! {
    #[test]
    fn prepared_ids_are_unique_and_capped(
        raw in prop::collection::vec("[a-f0-9]{1,3}", 0..60),
        cap in 1usize..40
    ) {
        let (kept, truncated) = prepare_ids(&raw, cap);

        let mut unique: Vec<String> = Vec::new();
        for id in &raw {
            if !unique.contains(id) {
                unique.push(id.clone());
            }
        }

        prop_assert_eq!(kept.len(), unique.len().min(cap));
        prop_assert_eq!(&kept[..], &unique[..kept.len()]);
        match truncated {
            Some(t) => {
                prop_assert!(unique.len() > cap);
                prop_assert_eq!(t.requested, unique.len());
                prop_assert_eq!(t.retained, cap);
                prop_assert_eq!(t.dropped, unique.len() - cap);
            }
            None => prop_assert!(unique.len() <= cap),
        }
    }

    #[test]
    fn cve_normalization_is_case_insensitive(year in 1999u32..2100, seq in 1000u32..999999) {
        let lower = format!("cve-{}-{}", year, seq);
        let upper = format!("CVE-{}-{}", year, seq);
        let normalized = normalize_entity_id(&lower);
        prop_assert_eq!(normalized.as_deref(), Some(upper.as_str()));
        prop_assert_eq!(EntityKind::classify(&upper), EntityKind::Cve);
    }

    #[test]
    fn normalization_never_panics(raw in "\\PC*") {
        if let Some(id) = normalize_entity_id(&raw) {
            prop_assert!(!id.is_empty());
            prop_assert_eq!(id.trim(), id.as_str());
        }
    }

    #[test]
    fn priority_list_has_no_duplicates(raw in "[a-z_, ]{0,40}") {
        let parsed = parse_priority(&raw);
        for (i, name) in parsed.iter().enumerate() {
            prop_assert!(!name.is_empty());
            prop_assert!(!parsed[i + 1..].contains(name));
        }
    }
}

// Property: Merging keeps the first supplier of each field
proptest! {
    #[test]
    fn merge_never_overwrites_present_fields(
        first in prop::option::of(0.0f64..=10.0),
        second in prop::option::of(0.0f64..=10.0)
    ) {
        let mut merged = IntelPayload {
            cvss_score: first,
            ..Default::default()
        };
        merged.merge_missing_from(&IntelPayload {
            cvss_score: second,
            ..Default::default()
        });
        prop_assert_eq!(merged.cvss_score, first.or(second));
    }
}
