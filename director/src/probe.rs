//! Kubernetes readiness probe (ambient per SPEC_FULL.md §1.5), mirroring
//! the teacher's `write_readiness_file`.

const READY_FILE: &str = "/var/run/cog/ready";

/// Marks the pod ready. A no-op outside Kubernetes (`KUBERNETES_SERVICE_HOST`
/// unset). Called once at the CREATED→SETUP transition (spec §4.8.1).
pub fn mark_ready() {
    if std::env::var_os("KUBERNETES_SERVICE_HOST").is_none() {
        return;
    }
    if let Err(err) = std::fs::write(READY_FILE, b"") {
        tracing::warn!(error = %err, path = READY_FILE, "failed to write readiness file");
    }
}
