//! Stamp core types: the served resource model, request context and typed config domains.

#![forbid(unsafe_code)]

use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod context;

pub use config::{Config, ConfigError, Defaults, Features, Flag};
pub use context::{Phase, RequestContext};

/// Identity of the authenticated actor behind a request.
pub use k8s_openapi::api::authentication::v1::UserInfo;

/// Annotation recording the actor that created the object. Written once.
pub const CREATOR_ANNOTATION: &str = "stamp.dev/creator";
/// Annotation recording the actor that last changed the object.
pub const UPDATER_ANNOTATION: &str = "stamp.dev/lastModifier";

/// Top-level declarative object: stamps out revisions from its template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ConfigurationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSpec {
    #[serde(default)]
    pub template: RevisionTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RevisionTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: RevisionSpec,
}

/// Pod shape plus the per-revision tunables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionSpec {
    #[serde(flatten)]
    pub pod_spec: PodSpec,
    /// Max in-flight requests per container; 0 means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_concurrency: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_start_timeout_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_seconds: Option<i64>,
}

impl Configuration {
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    /// Insert an annotation, creating the map on first write.
    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.into());
    }
}

pub mod prelude {
    pub use super::{
        Config, Configuration, ConfigurationSpec, Phase, RequestContext, RevisionSpec,
        RevisionTemplateSpec, UserInfo, CREATOR_ANNOTATION, UPDATER_ANNOTATION,
    };
}
