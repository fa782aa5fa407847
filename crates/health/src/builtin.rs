//! Built-in health rules for core kinds.

use ferry_core::{GroupKind, HealthStatus, ResourceHealth};
use serde_json::Value;

use crate::{HealthContext, HealthRegistry};

pub(crate) fn register_all(reg: &mut HealthRegistry) {
    reg.register(GroupKind::new("apps", "Deployment"), |o: &Value, _: &HealthContext<'_>| deployment(o));
    reg.register(GroupKind::new("apps", "StatefulSet"), |o: &Value, _: &HealthContext<'_>| statefulset(o));
    reg.register(GroupKind::new("apps", "DaemonSet"), |o: &Value, _: &HealthContext<'_>| daemonset(o));
    reg.register(GroupKind::new("apps", "ReplicaSet"), |o: &Value, _: &HealthContext<'_>| replicaset(o));
    reg.register(GroupKind::new("", "Pod"), |o: &Value, _: &HealthContext<'_>| pod(o));
    reg.register(GroupKind::new("batch", "Job"), |o: &Value, _: &HealthContext<'_>| job(o));
    reg.register(GroupKind::new("batch", "CronJob"), |o: &Value, _: &HealthContext<'_>| cronjob(o));
    reg.register(GroupKind::new("", "PersistentVolumeClaim"), |o: &Value, _: &HealthContext<'_>| pvc(o));
    reg.register(GroupKind::new("", "Service"), |o: &Value, _: &HealthContext<'_>| service(o));
    reg.register(GroupKind::new("networking.k8s.io", "Ingress"), |o: &Value, _: &HealthContext<'_>| ingress(o));
    reg.register(GroupKind::new("apiregistration.k8s.io", "APIService"), |o: &Value, _: &HealthContext<'_>| apiservice(o));
}

fn int(o: &Value, ptr: &str) -> Option<i64> { o.pointer(ptr).and_then(|v| v.as_i64()) }
fn int0(o: &Value, ptr: &str) -> i64 { int(o, ptr).unwrap_or(0) }
fn string<'a>(o: &'a Value, ptr: &str) -> Option<&'a str> { o.pointer(ptr).and_then(|v| v.as_str()) }
fn flag(o: &Value, ptr: &str) -> bool { o.pointer(ptr).and_then(|v| v.as_bool()).unwrap_or(false) }

fn name(o: &Value) -> &str { string(o, "/metadata/name").unwrap_or("") }

/// First status condition of the given type.
fn condition<'a>(o: &'a Value, kind: &str) -> Option<&'a Value> {
    o.pointer("/status/conditions")?.as_array()?.iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some(kind))
}

fn condition_true(c: &Value) -> bool { c.get("status").and_then(|s| s.as_str()) == Some("True") }

fn cond_message(c: &Value) -> String { c.get("message").and_then(|m| m.as_str()).unwrap_or("").to_string() }

/// Generation not yet observed by the controller.
fn generation_pending(o: &Value) -> bool { int0(o, "/metadata/generation") > int0(o, "/status/observedGeneration") }

fn healthy() -> ResourceHealth { ResourceHealth::new(HealthStatus::Healthy) }

fn progressing(msg: impl Into<String>) -> ResourceHealth { ResourceHealth::with_message(HealthStatus::Progressing, msg) }

fn degraded(msg: impl Into<String>) -> ResourceHealth { ResourceHealth::with_message(HealthStatus::Degraded, msg) }

fn deployment(o: &Value) -> ResourceHealth {
    if flag(o, "/spec/paused") {
        return ResourceHealth::with_message(HealthStatus::Suspended, "Deployment is paused");
    }
    if generation_pending(o) {
        return progressing("Waiting for rollout to finish: observed deployment generation less than desired generation");
    }
    if let Some(c) = condition(o, "Progressing") {
        if c.get("reason").and_then(|r| r.as_str()) == Some("ProgressDeadlineExceeded") {
            return degraded(format!("Deployment {:?} exceeded its progress deadline", name(o)));
        }
    }
    let updated = int0(o, "/status/updatedReplicas");
    let total = int0(o, "/status/replicas");
    let available = int0(o, "/status/availableReplicas");
    if let Some(want) = int(o, "/spec/replicas") {
        if updated < want {
            return progressing(format!(
                "Waiting for rollout to finish: {} out of {} new replicas have been updated...",
                updated, want
            ));
        }
    }
    if total > updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} old replicas are pending termination...",
            total - updated
        ));
    }
    if available < updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} of {} updated replicas are available...",
            available, updated
        ));
    }
    healthy()
}

fn statefulset(o: &Value) -> ResourceHealth {
    if int0(o, "/status/observedGeneration") == 0 || generation_pending(o) {
        return progressing("Waiting for statefulset spec update to be observed...");
    }
    let ready = int0(o, "/status/readyReplicas");
    if let Some(want) = int(o, "/spec/replicas") {
        if ready < want {
            return progressing(format!("Waiting for {} pods to be ready...", want - ready));
        }
    }
    if string(o, "/spec/updateStrategy/type") == Some("OnDelete") {
        return ResourceHealth::with_message(HealthStatus::Healthy, "statefulset has OnDelete update strategy");
    }
    if let Some(partition) = int(o, "/spec/updateStrategy/rollingUpdate/partition") {
        let want = int(o, "/spec/replicas").unwrap_or(1);
        let updated = int0(o, "/status/updatedReplicas");
        if updated < want - partition {
            return progressing(format!(
                "Waiting for partitioned roll out to finish: {} out of {} new pods have been updated...",
                updated,
                want - partition
            ));
        }
        return ResourceHealth::with_message(HealthStatus::Healthy, "partitioned roll out complete");
    }
    if string(o, "/status/updateRevision") != string(o, "/status/currentRevision") {
        return progressing("waiting for statefulset rolling update to complete");
    }
    healthy()
}

fn daemonset(o: &Value) -> ResourceHealth {
    if generation_pending(o) {
        return progressing("Waiting for rollout to finish: observed daemon set generation less than desired generation");
    }
    if string(o, "/spec/updateStrategy/type") == Some("OnDelete") {
        return ResourceHealth::with_message(HealthStatus::Healthy, "daemon set has OnDelete update strategy");
    }
    let desired = int0(o, "/status/desiredNumberScheduled");
    let updated = int0(o, "/status/updatedNumberScheduled");
    let available = int0(o, "/status/numberAvailable");
    if updated < desired {
        return progressing(format!(
            "Waiting for daemon set {:?} rollout to finish: {} out of {} new pods have been updated...",
            name(o),
            updated,
            desired
        ));
    }
    if available < desired {
        return progressing(format!(
            "Waiting for daemon set {:?} rollout to finish: {} of {} updated pods are available...",
            name(o),
            available,
            desired
        ));
    }
    healthy()
}

fn replicaset(o: &Value) -> ResourceHealth {
    if generation_pending(o) {
        return progressing("Waiting for rollout to finish: observed replica set generation less than desired generation");
    }
    if let Some(c) = condition(o, "ReplicaFailure").filter(|c| condition_true(c)) {
        return degraded(cond_message(c));
    }
    if let Some(want) = int(o, "/spec/replicas") {
        let available = int0(o, "/status/availableReplicas");
        if available < want {
            return progressing(format!(
                "Waiting for rollout to finish: {} out of {} new replicas are available...",
                available, want
            ));
        }
    }
    healthy()
}

const POD_FAILURE_REASONS: &[&str] =
    &["ErrImagePull", "ImagePullBackOff", "CrashLoopBackOff", "CreateContainerConfigError", "InvalidImageName", "RunContainerError"];

/// First container stuck waiting for a reason that will not resolve on its own.
fn stuck_container(o: &Value) -> Option<String> {
    ["/status/initContainerStatuses", "/status/containerStatuses"]
        .iter()
        .filter_map(|p| o.pointer(p).and_then(|v| v.as_array()))
        .flatten()
        .find_map(|cs| {
            let waiting = cs.pointer("/state/waiting")?;
            let reason = waiting.get("reason")?.as_str()?;
            if !POD_FAILURE_REASONS.contains(&reason) { return None; }
            Some(waiting.get("message").and_then(|m| m.as_str()).unwrap_or(reason).to_string())
        })
}

fn pod(o: &Value) -> ResourceHealth {
    let msg = string(o, "/status/message").unwrap_or("").to_string();
    match string(o, "/status/phase") {
        Some("Pending") => match stuck_container(o) {
            Some(reason) => degraded(reason),
            None => ResourceHealth { status: HealthStatus::Progressing, message: Some(msg).filter(|m| !m.is_empty()) },
        },
        Some("Succeeded") => ResourceHealth { status: HealthStatus::Healthy, message: Some(msg).filter(|m| !m.is_empty()) },
        Some("Failed") => {
            let m = if msg.is_empty() { stuck_container(o).unwrap_or_default() } else { msg };
            ResourceHealth { status: HealthStatus::Degraded, message: Some(m).filter(|m| !m.is_empty()) }
        }
        Some("Running") => {
            if let Some(reason) = stuck_container(o) {
                return degraded(reason);
            }
            if string(o, "/spec/restartPolicy").unwrap_or("Always") != "Always" {
                return progressing("Pod is running to completion");
            }
            let all_ready = o
                .pointer("/status/containerStatuses")
                .and_then(|v| v.as_array())
                .map(|cs| cs.iter().all(|c| c.get("ready").and_then(|r| r.as_bool()).unwrap_or(false)))
                .unwrap_or(false);
            if all_ready { healthy() } else { progressing("Waiting for containers to become ready") }
        }
        _ => ResourceHealth { status: HealthStatus::Unknown, message: Some(msg).filter(|m| !m.is_empty()) },
    }
}

fn job(o: &Value) -> ResourceHealth {
    if let Some(c) = condition(o, "Failed").filter(|c| condition_true(c)) {
        return degraded(cond_message(c));
    }
    if condition(o, "Complete").map(condition_true).unwrap_or(false) {
        return healthy();
    }
    if flag(o, "/spec/suspend") || condition(o, "Suspended").map(condition_true).unwrap_or(false) {
        return ResourceHealth::with_message(HealthStatus::Suspended, "Job is suspended");
    }
    progressing("Job is running")
}

fn cronjob(o: &Value) -> ResourceHealth {
    if flag(o, "/spec/suspend") {
        return ResourceHealth::with_message(HealthStatus::Suspended, "CronJob is suspended");
    }
    healthy()
}

fn pvc(o: &Value) -> ResourceHealth {
    match string(o, "/status/phase") {
        Some("Bound") => healthy(),
        Some("Pending") => progressing("Waiting for volume to be bound"),
        Some("Lost") => degraded("Bound volume is lost"),
        _ => ResourceHealth::new(HealthStatus::Unknown),
    }
}

fn has_lb_ingress(o: &Value) -> bool {
    o.pointer("/status/loadBalancer/ingress").and_then(|v| v.as_array()).map(|a| !a.is_empty()).unwrap_or(false)
}

fn service(o: &Value) -> ResourceHealth {
    if string(o, "/spec/type") == Some("LoadBalancer") && !has_lb_ingress(o) {
        return progressing("Waiting for load balancer address");
    }
    healthy()
}

fn ingress(o: &Value) -> ResourceHealth {
    if has_lb_ingress(o) { healthy() } else { progressing("Waiting for load balancer address") }
}

fn apiservice(o: &Value) -> ResourceHealth {
    match condition(o, "Available") {
        Some(c) if condition_true(c) => healthy(),
        Some(c) => degraded(cond_message(c)),
        None => progressing("Waiting to be processed"),
    }
}
