//! Per-request data carried into defaulting.
//!
//! A `RequestContext` is built once per request and passed explicitly to every
//! defaulting call. It never mutates the objects it refers to.

use std::sync::Arc;

use crate::{Config, Configuration, UserInfo};

/// Which kind of request is being defaulted.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Phase<'a> {
    /// Not inside an admission request (e.g. a reconcile loop).
    #[default]
    None,
    Create,
    /// Carries the stored object being replaced.
    Update(&'a Configuration),
}

#[derive(Debug, Clone, Default)]
pub struct RequestContext<'a> {
    phase: Phase<'a>,
    user: Option<UserInfo>,
    config: Option<Arc<Config>>,
}

impl<'a> RequestContext<'a> {
    /// Empty context: no phase, no actor, no snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn within_create(mut self) -> Self {
        self.phase = Phase::Create;
        self
    }

    pub fn within_update(mut self, previous: &'a Configuration) -> Self {
        self.phase = Phase::Update(previous);
        self
    }

    pub fn with_user_info(mut self, user: UserInfo) -> Self {
        self.user = Some(user);
        self
    }

    pub fn with_config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn phase(&self) -> Phase<'a> {
        self.phase
    }

    pub fn is_in_create(&self) -> bool {
        matches!(self.phase, Phase::Create)
    }

    pub fn is_in_update(&self) -> bool {
        matches!(self.phase, Phase::Update(_))
    }

    pub fn previous(&self) -> Option<&'a Configuration> {
        match self.phase {
            Phase::Update(prev) => Some(prev),
            _ => None,
        }
    }

    /// Actor identity; a user without a non-empty username counts as absent.
    pub fn user_info(&self) -> Option<&UserInfo> {
        self.user
            .as_ref()
            .filter(|u| u.username.as_deref().is_some_and(|n| !n.is_empty()))
    }

    pub fn username(&self) -> Option<&str> {
        self.user_info().and_then(|u| u.username.as_deref())
    }

    pub fn config(&self) -> Option<&Arc<Config>> {
        self.config.as_ref()
    }
}

/// Shorthand for a `UserInfo` carrying only a username.
pub fn user(name: impl Into<String>) -> UserInfo {
    UserInfo { username: Some(name.into()), ..Default::default() }
}
