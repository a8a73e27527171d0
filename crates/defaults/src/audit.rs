//! Creator/updater annotations.
//!
//! An object moves `Unset -> Created -> Updated*`. The creator is only written
//! when there is no previous object; an update writes the updater, and only
//! when the object really changed.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use metrics::counter;
use stamp_core::{Configuration, RequestContext, CREATOR_ANNOTATION, UPDATER_ANNOTATION};
use tracing::debug;

/// Audit trail as read back from an object's annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditState {
    Unset,
    Created { creator: String },
    /// `creator` is absent on objects that predate auditing.
    Updated { creator: Option<String>, updater: String },
}

impl AuditState {
    pub fn of(obj: &Configuration) -> Self {
        let creator = obj.annotation(CREATOR_ANNOTATION).map(str::to_string);
        let updater = obj.annotation(UPDATER_ANNOTATION).map(str::to_string);
        match (creator, updater) {
            (None, None) => AuditState::Unset,
            (Some(c), None) => AuditState::Created { creator: c },
            (Some(c), Some(u)) if c == u => AuditState::Created { creator: c },
            (creator, Some(updater)) => AuditState::Updated { creator, updater },
        }
    }
}

/// What a defaulting pass must write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction<'u> {
    Keep,
    Create(&'u str),
    Update(&'u str),
}

/// Decide the transition for `current` under `ctx`.
pub fn decide<'u>(ctx: &'u RequestContext<'_>, current: &Configuration) -> AuditAction<'u> {
    let Some(user) = ctx.username() else {
        return AuditAction::Keep;
    };
    match ctx.previous() {
        None => AuditAction::Create(user),
        Some(prev) if semantically_equal(current, prev) => AuditAction::Keep,
        Some(_) => AuditAction::Update(user),
    }
}

pub fn record(obj: &mut Configuration, action: AuditAction<'_>) {
    match action {
        AuditAction::Keep => {}
        AuditAction::Create(user) => {
            obj.set_annotation(CREATOR_ANNOTATION, user);
            obj.set_annotation(UPDATER_ANNOTATION, user);
        }
        AuditAction::Update(user) => {
            obj.set_annotation(UPDATER_ANNOTATION, user);
            counter!("audit_updates_total", 1u64);
        }
    }
}

/// Decide and write in one step; the last step of every defaulting pass.
pub fn stamp(ctx: &RequestContext<'_>, obj: &mut Configuration) {
    let action = decide(ctx, obj);
    if action != AuditAction::Keep {
        debug!(name = ?obj.metadata.name, ?action, "writing audit annotations");
    }
    record(obj, action);
}

/// Equality over spec and metadata, ignoring the audit annotations.
/// A missing annotation map equals an empty one.
pub fn semantically_equal(a: &Configuration, b: &Configuration) -> bool {
    a.spec == b.spec && without_audit(&a.metadata) == without_audit(&b.metadata)
}

fn without_audit(meta: &ObjectMeta) -> ObjectMeta {
    let mut m = meta.clone();
    if let Some(anns) = m.annotations.as_mut() {
        anns.remove(CREATOR_ANNOTATION);
        anns.remove(UPDATER_ANNOTATION);
    }
    if m.annotations.as_ref().is_some_and(|a| a.is_empty()) {
        m.annotations = None;
    }
    m
}
