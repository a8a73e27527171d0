#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use stamp_core::context::user;
use stamp_core::{Configuration, RequestContext, CREATOR_ANNOTATION, UPDATER_ANNOTATION};
use stamp_defaults::{AuditState, SetDefaults};
use stamp_store::{ConfigChange, ConfigStore};

const U1: &str = "oveja@stamp.dev";
const U2: &str = "cabra@stamp.dev";
const U3: &str = "vaca@stamp.dev";

fn with_user_anns(creator: &str, updater: &str, mut c: Configuration) -> Configuration {
    c.set_annotation(CREATOR_ANNOTATION, creator);
    c.set_annotation(UPDATER_ANNOTATION, updater);
    c
}

fn with_concurrency(n: i64) -> Configuration {
    let mut c = Configuration::default();
    c.spec.template.spec.container_concurrency = Some(n);
    c
}

fn anns(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Default `prev` as the stored object would have been, then default `this`
/// as an update of it.
fn run(user_name: &str, mut this: Configuration, prev: Option<Configuration>) -> BTreeMap<String, String> {
    match prev {
        Some(mut prev) => {
            prev.set_defaults(&RequestContext::new());
            this.set_defaults(&RequestContext::new().with_user_info(user(user_name)).within_update(&prev));
        }
        None => this.set_defaults(&RequestContext::new().with_user_info(user(user_name))),
    }
    this.metadata.annotations.unwrap_or_default()
}

#[test]
fn create_new_sets_creator_and_updater() {
    let got = run(U1, Configuration::default(), None);
    assert_eq!(got, anns(&[(CREATOR_ANNOTATION, U1), (UPDATER_ANNOTATION, U1)]));
}

#[test]
fn update_no_diff_old_object_adds_nothing() {
    // Objects from before auditing stay unannotated until something changes.
    let got = run(U1, Configuration::default(), Some(Configuration::default()));
    assert!(got.is_empty(), "got {got:?}");
}

#[test]
fn update_no_diff_new_object_keeps_inherited_annotations() {
    let got = run(
        U2,
        with_user_anns(U1, U1, Configuration::default()),
        Some(with_user_anns(U1, U1, Configuration::default())),
    );
    assert_eq!(got, anns(&[(CREATOR_ANNOTATION, U1), (UPDATER_ANNOTATION, U1)]));
}

#[test]
fn update_diff_old_object_sets_updater_only() {
    let got = run(U2, with_concurrency(1), Some(with_concurrency(2)));
    assert_eq!(got, anns(&[(UPDATER_ANNOTATION, U2)]));
}

#[test]
fn update_diff_new_object_keeps_creator() {
    let got = run(
        U3,
        with_user_anns(U1, U2, with_concurrency(1)),
        Some(with_user_anns(U1, U2, with_concurrency(2))),
    );
    assert_eq!(got, anns(&[(CREATOR_ANNOTATION, U1), (UPDATER_ANNOTATION, U3)]));
}

#[test]
fn metadata_changes_count_as_a_diff() {
    let prev = with_user_anns(U1, U1, Configuration::default());
    let mut this = prev.clone();
    this.set_annotation("team", "web");
    this.set_defaults(&RequestContext::new().with_user_info(user(U2)).within_update(&prev));
    assert_eq!(AuditState::of(&this), AuditState::Updated { creator: Some(U1.into()), updater: U2.into() });
}

#[test]
fn no_actor_never_writes() {
    let prev = with_concurrency(2);
    let mut this = with_concurrency(1);
    this.set_defaults(&RequestContext::new().within_update(&prev));
    assert!(this.metadata.annotations.is_none());

    let mut fresh = Configuration::default();
    fresh.set_defaults(&RequestContext::new().within_create());
    assert!(fresh.metadata.annotations.is_none());
}

#[test]
fn second_pass_is_idempotent() {
    let store = ConfigStore::new();
    store.on_config_changed(&ConfigChange::new(
        "config-defaults",
        BTreeMap::from([("revision-timeout-seconds".to_string(), "400".to_string())]),
    ));
    let mut obj = Configuration::default();
    obj.spec.template.spec.pod_spec.containers = vec![Container { image: Some("busybox".into()), ..Default::default() }];

    obj.set_defaults(&store.to_context(RequestContext::new().within_create().with_user_info(user(U1))));
    let first = obj.clone();

    obj.set_defaults(&store.to_context(RequestContext::new().within_update(&first).with_user_info(user(U1))));
    assert_eq!(obj, first);
}

#[test]
fn creator_survives_later_updates_by_others() {
    let mut obj = Configuration::default();
    obj.set_defaults(&RequestContext::new().within_create().with_user_info(user(U1)));

    // No-op update by someone else: nothing moves.
    let stored = obj.clone();
    obj.set_defaults(&RequestContext::new().within_update(&stored).with_user_info(user(U2)));
    assert_eq!(obj, stored);

    // Real change by the same someone else: only the updater moves.
    let stored = obj.clone();
    obj.spec.template.spec.timeout_seconds = Some(30);
    obj.set_defaults(&RequestContext::new().within_update(&stored).with_user_info(user(U2)));
    assert_eq!(obj.annotation(CREATOR_ANNOTATION), Some(U1));
    assert_eq!(obj.annotation(UPDATER_ANNOTATION), Some(U2));
}
