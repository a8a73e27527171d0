//! Defaulting of `Configuration` objects.
//!
//! Every field resolves in the same order: a value already on the object
//! wins, then the config snapshot, then the built-in constant. Defaulting is
//! total; it never fails and never replaces the object.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Capabilities, Container, PodSpec, Probe, SeccompProfile, SecurityContext, TCPSocketAction,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use stamp_core::{
    Config, Configuration, ConfigurationSpec, Defaults, Flag, RequestContext, RevisionSpec,
    RevisionTemplateSpec,
};
use tracing::trace;

use crate::audit;

/// In-place defaulting under a request context.
pub trait SetDefaults {
    fn set_defaults(&mut self, ctx: &RequestContext<'_>);
}

impl SetDefaults for Configuration {
    fn set_defaults(&mut self, ctx: &RequestContext<'_>) {
        // A pinned revision name with an unchanged spec must not fork a new
        // revision, so the template is left exactly as stored.
        let pinned = self.spec.template.metadata.name.is_some()
            && ctx.previous().is_some_and(|prev| prev.spec == self.spec);
        if pinned {
            trace!(name = ?self.spec.template.metadata.name, "revision name pinned, spec unchanged");
        } else {
            self.spec.set_defaults(ctx);
        }
        audit::stamp(ctx, self);
    }
}

impl SetDefaults for ConfigurationSpec {
    fn set_defaults(&mut self, ctx: &RequestContext<'_>) {
        self.template.set_defaults(ctx);
    }
}

impl SetDefaults for RevisionTemplateSpec {
    fn set_defaults(&mut self, ctx: &RequestContext<'_>) {
        self.spec.set_defaults(ctx);
    }
}

impl SetDefaults for RevisionSpec {
    fn set_defaults(&mut self, ctx: &RequestContext<'_>) {
        let cfg = Config::from_context(ctx);
        let d = &cfg.defaults;
        trace!(epoch = cfg.epoch, "defaulting revision spec");

        let timeout = *self.timeout_seconds.get_or_insert(d.revision_timeout.as_secs() as i64);
        if self.response_start_timeout_seconds.is_none() {
            self.response_start_timeout_seconds = below_timeout(d.revision_response_start_timeout, timeout);
        }
        if self.idle_timeout_seconds.is_none() {
            self.idle_timeout_seconds = below_timeout(d.revision_idle_timeout, timeout);
        }
        if self.container_concurrency.is_none() {
            self.container_concurrency = Some(d.container_concurrency);
        }

        // Only new objects pick up the default; running revisions keep their env.
        if ctx.is_in_create() && self.pod_spec.enable_service_links.is_none() {
            self.pod_spec.enable_service_links = d.enable_service_links;
        }

        default_containers(&mut self.pod_spec, d, cfg.features.secure_pod_defaults == Flag::Enabled);
    }
}

/// Seconds to install for an optional timeout, or `None` when it would only
/// repeat the request timeout or outlive it.
fn below_timeout(configured: Option<std::time::Duration>, timeout: i64) -> Option<i64> {
    configured.map(|v| v.as_secs() as i64).filter(|&v| v < timeout)
}

fn default_containers(pod: &mut PodSpec, d: &Defaults, secure: bool) {
    let single = pod.containers.len() == 1;
    // Several unnamed containers are ambiguous; leave naming to validation.
    if single && pod.containers[0].name.is_empty() {
        pod.containers[0].name = d.user_container_name.clone();
    }

    let pod_non_root = pod.security_context.as_ref().and_then(|s| s.run_as_non_root).is_some();
    let pod_seccomp = pod.security_context.as_ref().and_then(|s| s.seccomp_profile.as_ref()).is_some();

    for c in pod.containers.iter_mut() {
        default_resources(c, d);
        let has_ports = c.ports.as_ref().is_some_and(|p| !p.is_empty());
        if single || has_ports {
            default_readiness_probe(c);
        }
        if secure {
            harden(c, pod_non_root, pod_seccomp);
        }
    }
}

fn default_resources(c: &mut Container, d: &Defaults) {
    let res = c.resources.get_or_insert_with(Default::default);
    for (name, request, limit) in d.resource_defaults() {
        if let Some(q) = request {
            fill(&mut res.requests, name, q);
        }
        if let Some(q) = limit {
            fill(&mut res.limits, name, q);
        }
    }
}

fn fill(list: &mut Option<BTreeMap<String, Quantity>>, name: &str, q: &Quantity) {
    list.get_or_insert_with(BTreeMap::new).entry(name.to_string()).or_insert_with(|| q.clone());
}

fn default_readiness_probe(c: &mut Container) {
    let p = c.readiness_probe.get_or_insert_with(Probe::default);
    if p.tcp_socket.is_none() && p.http_get.is_none() && p.exec.is_none() && p.grpc.is_none() {
        // Port 0 targets the container's serving port.
        p.tcp_socket = Some(TCPSocketAction { host: None, port: IntOrString::Int(0) });
    }
    if p.success_threshold.unwrap_or(0) == 0 {
        p.success_threshold = Some(1);
    }
    if p.period_seconds.unwrap_or(0) != 0 {
        if p.failure_threshold.unwrap_or(0) == 0 {
            p.failure_threshold = Some(3);
        }
        if p.timeout_seconds.unwrap_or(0) == 0 {
            p.timeout_seconds = Some(1);
        }
    }
}

fn harden(c: &mut Container, pod_non_root: bool, pod_seccomp: bool) {
    let sc = c.security_context.get_or_insert_with(SecurityContext::default);
    if sc.allow_privilege_escalation.is_none() {
        sc.allow_privilege_escalation = Some(false);
    }
    if sc.run_as_non_root.is_none() && !pod_non_root {
        sc.run_as_non_root = Some(true);
    }
    let caps = sc.capabilities.get_or_insert_with(Capabilities::default);
    if caps.drop.is_none() {
        caps.drop = Some(vec!["ALL".to_string()]);
    }
    if sc.seccomp_profile.is_none() && !pod_seccomp {
        sc.seccomp_profile = Some(SeccompProfile { type_: "RuntimeDefault".to_string(), ..Default::default() });
    }
}
