use super::*;
use crate::k8s::serving;

fn mk_target(revision: Option<&str>, percent: i64, latest: bool) -> serving::TrafficTarget {
    serving::TrafficTarget {
        revision_name: revision.map(Into::into),
        percent: Some(percent),
        latest_revision: Some(latest),
        tag: None,
    }
}

fn mk_revision(name: &str, generation: i64) -> serving::Revision {
    let mut rev = serving::Revision::new(name, serving::RevisionSpec::default());
    rev.metadata.labels.insert(
        labels::KNATIVE_CONFIGURATION_GENERATION.to_string(),
        generation.to_string(),
    );
    rev
}

fn mk_selector(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[test]
fn shift_splits_between_latest_and_previous() {
    // One ready revision at 100%, shifted to 50/50.
    let existing = vec![mk_target(Some("svc-00001"), 100, true)];
    let targets = shift_traffic(&existing, 50);

    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].latest_revision, Some(true));
    assert_eq!(targets[0].percent, Some(50));
    assert_eq!(targets[0].revision_name, None);
    assert_eq!(targets[1].revision_name.as_deref(), Some("svc-00001"));
    assert_eq!(targets[1].percent, Some(50));
    assert_eq!(targets[1].latest_revision, Some(false));
}

#[test]
fn shift_drops_zero_percent_targets() {
    let existing = vec![
        mk_target(Some("svc-00001"), 100, true),
        mk_target(Some("svc-00000"), 0, false),
    ];
    let targets = shift_traffic(&existing, 100);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].latest_revision, Some(true));
    assert_eq!(targets[0].percent, Some(100));

    // A full shift away from latest keeps only named targets.
    let targets = shift_traffic(&existing, 0);
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].revision_name.as_deref(), Some("svc-00001"));
    assert_eq!(targets[0].percent, Some(100));
}

#[test]
fn shift_coalesces_duplicate_revisions() {
    let existing = vec![
        mk_target(Some("svc-00001"), 60, false),
        mk_target(Some("svc-00001"), 40, false),
    ];
    let targets = shift_traffic(&existing, 50);
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[1].revision_name.as_deref(), Some("svc-00001"));
    assert_eq!(targets[1].percent, Some(50));
}

#[test]
fn shift_preserves_the_total_where_division_allows() {
    let existing = vec![
        mk_target(Some("svc-00001"), 50, false),
        mk_target(Some("svc-00002"), 50, false),
    ];
    let targets = shift_traffic(&existing, 50);
    let total: i64 = targets.iter().filter_map(|t| t.percent).sum();
    assert_eq!(total, 100);
}

#[test]
fn prune_selects_oldest_unreferenced() {
    let mut revisions = vec![
        mk_revision("svc-00003", 3),
        mk_revision("svc-00001", 1),
        mk_revision("svc-00002", 2),
        mk_revision("svc-00004", 4),
    ];
    sort_oldest_first(&mut revisions);
    assert_eq!(revisions[0].name(), "svc-00001");

    let in_use = HashSet::new();
    assert_eq!(
        prune_candidates(&revisions, &in_use, 2),
        vec!["svc-00001".to_string(), "svc-00002".to_string()]
    );
}

#[test]
fn prune_skips_revisions_still_routing_traffic() {
    let mut revisions = vec![
        mk_revision("svc-00001", 1),
        mk_revision("svc-00002", 2),
        mk_revision("svc-00003", 3),
    ];
    sort_oldest_first(&mut revisions);

    let in_use = vec!["svc-00001".to_string()].into_iter().collect();
    assert_eq!(
        prune_candidates(&revisions, &in_use, 2),
        vec!["svc-00002".to_string()]
    );
}

#[test]
fn prune_is_a_noop_within_the_keep_count() {
    let revisions = vec![mk_revision("svc-00001", 1), mk_revision("svc-00002", 2)];
    assert!(prune_candidates(&revisions, &HashSet::new(), 3).is_empty());
}

#[test]
fn scope_table_allows_the_documented_tuples() {
    // namespace-id + workflow-id + name => service, normalized to workflow.
    let sel = mk_selector(&[
        (labels::SCOPE, "s"),
        (labels::NAMESPACE_ID, "ns1"),
        (labels::WORKFLOW_ID, "wf1"),
        (labels::NAME, "echo"),
    ]);
    assert_eq!(classify(&sel).unwrap(), Scope::Workflow);

    // namespace-id + workflow-id => workflow.
    let sel = mk_selector(&[
        (labels::SCOPE, "w"),
        (labels::NAMESPACE_ID, "ns1"),
        (labels::WORKFLOW_ID, "wf1"),
    ]);
    assert_eq!(classify(&sel).unwrap(), Scope::Workflow);

    // namespace-id with or without name => namespace.
    let sel = mk_selector(&[
        (labels::SCOPE, "ns"),
        (labels::NAMESPACE_ID, "ns1"),
        (labels::NAME, "echo"),
    ]);
    assert_eq!(classify(&sel).unwrap(), Scope::Namespace);
    let sel = mk_selector(&[(labels::SCOPE, "ns"), (labels::NAMESPACE_ID, "ns1")]);
    assert_eq!(classify(&sel).unwrap(), Scope::Namespace);

    // Nothing at all => global.
    let sel = mk_selector(&[(labels::SCOPE, "g")]);
    assert_eq!(classify(&sel).unwrap(), Scope::Global);
}

#[test]
fn scope_table_rejects_inconsistent_tuples() {
    // workflow-id without namespace-id is never valid.
    let sel = mk_selector(&[(labels::SCOPE, "w"), (labels::WORKFLOW_ID, "wf1")]);
    assert!(matches!(classify(&sel), Err(Error::Invalid(_))));

    // A name alone is never valid.
    let sel = mk_selector(&[(labels::SCOPE, "g"), (labels::NAME, "echo")]);
    assert!(matches!(classify(&sel), Err(Error::Invalid(_))));

    // The declared scope must match the tuple.
    let sel = mk_selector(&[(labels::SCOPE, "g"), (labels::NAMESPACE_ID, "ns1")]);
    assert!(matches!(classify(&sel), Err(Error::Invalid(_))));

    // Missing scope label.
    let sel = mk_selector(&[(labels::NAMESPACE_ID, "ns1")]);
    assert!(matches!(classify(&sel), Err(Error::Invalid(_))));

    // Unknown scope value.
    let sel = mk_selector(&[(labels::SCOPE, "bogus"), (labels::NAMESPACE_ID, "ns1")]);
    assert!(matches!(classify(&sel), Err(Error::Invalid(_))));
}

#[test]
fn list_selector_rewrites_service_scope() {
    let sel = mk_selector(&[
        (labels::SCOPE, "s"),
        (labels::NAMESPACE_ID, "ns1"),
        (labels::WORKFLOW_ID, "wf1"),
        (labels::NAME, "echo"),
    ]);
    let selector = list_selector(&sel).unwrap();
    assert!(selector.contains("direktiv.io/scope=w"));
    assert!(!selector.contains("direktiv.io/scope=s"));
}

#[test]
fn existing_targets_prefer_status() {
    let mut svc = serving::Service::new(
        "w-1",
        serving::ServiceSpec {
            template: serving::RevisionTemplate::default(),
            traffic: vec![mk_target(None, 100, true)],
        },
    );
    assert_eq!(existing_targets(&svc)[0].revision_name, None);

    svc.status = Some(serving::ServiceStatus {
        traffic: vec![mk_target(Some("w-1-00001"), 100, true)],
        ..Default::default()
    });
    assert_eq!(
        existing_targets(&svc)[0].revision_name.as_deref(),
        Some("w-1-00001")
    );
}
