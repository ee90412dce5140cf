//! Property tests for negotiation and end-reason latching

use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use switchboard_core::{
    CallEndReason, CallManager, Connection, LocalEndpoint, LocalEndpointConfig, ManagerConfig,
    TranscoderRegistry,
};

const AUDIO: [&str; 5] = ["PCM-16", "PCMU", "PCMA", "G.729", "G.722"];

fn format_subset() -> impl Strategy<Value = Vec<&'static str>> {
    proptest::sample::subsequence(AUDIO.to_vec(), 1..=AUDIO.len()).prop_shuffle()
}

fn reason() -> impl Strategy<Value = CallEndReason> {
    prop_oneof![
        Just(CallEndReason::LocalUser),
        Just(CallEndReason::RemoteUser),
        Just(CallEndReason::NoAnswer),
        Just(CallEndReason::Refused),
        Just(CallEndReason::NoUser),
        Just(CallEndReason::TemporaryFailure),
        Just(CallEndReason::MediaFailed),
        Just(CallEndReason::CallForwarded),
    ]
}

/// A call with one connection per format list, each on its own endpoint
fn call_with(lists: &[Vec<&'static str>]) -> (Arc<CallManager>, Arc<switchboard_core::Call>) {
    let manager = CallManager::new(ManagerConfig::default(), TranscoderRegistry::new());
    let call = manager.create_call().unwrap();
    for (i, formats) in lists.iter().enumerate() {
        let endpoint = LocalEndpoint::new(LocalEndpointConfig {
            prefix: format!("ep{i}"),
            formats: formats.iter().map(|f| f.to_string()).collect(),
            ..Default::default()
        })
        .unwrap();
        manager.attach_endpoint(endpoint);
        manager
            .make_connection(&call, &format!("ep{i}:party{i}"))
            .unwrap();
    }
    (manager, call)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn intersection_matches_set_semantics(
        lists in proptest::collection::vec(format_subset(), 3..=5)
    ) {
        let (_manager, call) = call_with(&lists);
        let connections = call.connections();
        let target = connections[0].clone();

        let negotiated = call.media_formats(target.as_ref(), false);
        let got: BTreeSet<String> = negotiated.names().into_iter().collect();

        let mut expected: BTreeSet<String> = lists[1].iter().map(|s| s.to_string()).collect();
        for list in &lists[2..] {
            let other: BTreeSet<String> = list.iter().map(|s| s.to_string()).collect();
            expected = expected.intersection(&other).cloned().collect();
        }
        prop_assert_eq!(&got, &expected);

        // Order follows the first list examined.
        let first_order: Vec<String> = lists[1]
            .iter()
            .map(|s| s.to_string())
            .filter(|s| expected.contains(s))
            .collect();
        prop_assert_eq!(negotiated.names(), first_order);
        call.clear(CallEndReason::LocalUser, None);
    }

    #[test]
    fn intersection_is_order_independent(
        a in format_subset(),
        b in format_subset(),
        c in format_subset(),
    ) {
        let names = |call: &switchboard_core::Call, target: &dyn Connection| {
            call.media_formats(target, false)
                .names()
                .into_iter()
                .collect::<BTreeSet<_>>()
        };

        let (_m1, forward) = call_with(&[a.clone(), b.clone(), c.clone()]);
        let (_m2, backward) = call_with(&[a, c, b]);
        let f = names(&forward, forward.connections()[0].as_ref());
        let r = names(&backward, backward.connections()[0].as_ref());
        prop_assert_eq!(f, r);
        forward.clear(CallEndReason::LocalUser, None);
        backward.clear(CallEndReason::LocalUser, None);
    }

    #[test]
    fn first_end_reason_wins(reasons in proptest::collection::vec(reason(), 1..8)) {
        let (_manager, call) = call_with(&[vec!["PCMU"], vec!["PCMU"]]);
        for reason in &reasons {
            call.clear(*reason, None);
        }
        prop_assert!(call.is_cleared());
        prop_assert_eq!(call.end_reason(), Some(reasons[0]));
    }

    #[test]
    fn latched_reason_never_changes(reasons in proptest::collection::vec(reason(), 1..8)) {
        let (_manager, call) = call_with(&[vec!["PCMU"], vec!["PCMU"]]);
        for reason in &reasons {
            call.set_end_reason(*reason);
        }
        prop_assert_eq!(call.end_reason(), Some(reasons[0]));
        call.clear(CallEndReason::LocalUser, None);
        prop_assert_eq!(call.end_reason(), Some(reasons[0]));
    }
}
