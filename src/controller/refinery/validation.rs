use crate::crd::refinery::RefinerySpec;

const PULL_POLICIES: &[&str] = &["Always", "IfNotPresent", "Never"];

/// Validate a Refinery spec before anything is deployed
///
/// At least one output silo must be enabled, and an enabled silo must name its
/// target (a filename for `file`, a uri for the others).
pub fn validate_refinery(spec: &RefinerySpec) -> Result<(), String> {
    if spec.workers < 0 {
        return Err(format!("spec.workers must not be negative, got {}", spec.workers));
    }

    let Some(storage) = &spec.storage else {
        return Err("spec.output is required".to_string());
    };

    let mut enabled = 0;
    if let Some(file) = storage.file.as_ref().filter(|s| s.enabled) {
        enabled += 1;
        if file.filename.is_empty() {
            return Err("spec.output.file.filename is required when file output is enabled".to_string());
        }
        if file.queue_size < 0 {
            return Err("spec.output.file.queuesize must not be negative".to_string());
        }
    }
    let uri_silos = [
        ("tcp", storage.tcp.as_ref().map(|s| (s.enabled, s.uri.as_str()))),
        ("http", storage.http.as_ref().map(|s| (s.enabled, s.uri.as_str()))),
        (
            "elasticsearch",
            storage.elasticsearch.as_ref().map(|s| (s.enabled, s.uri.as_str())),
        ),
        ("kafka", storage.kafka.as_ref().map(|s| (s.enabled, s.uri.as_str()))),
    ];
    for (silo, settings) in uri_silos {
        if let Some((true, uri)) = settings {
            enabled += 1;
            if uri.is_empty() {
                return Err(format!(
                    "spec.output.{}.uri is required when {} output is enabled",
                    silo, silo
                ));
            }
        }
    }
    if storage.stdout.as_ref().is_some_and(|s| s.enabled) {
        enabled += 1;
    }
    if storage.http.as_ref().is_some_and(|s| s.response_buffer < 0) {
        return Err("spec.output.http.response_buffer must not be negative".to_string());
    }

    if enabled == 0 {
        return Err("spec.output enables no output silo".to_string());
    }

    if let Some(policy) = spec
        .goreplay
        .as_ref()
        .and_then(|g| g.image_pull_policy.as_deref())
        .filter(|p| !p.is_empty())
    {
        if !PULL_POLICIES.contains(&policy) {
            return Err(format!(
                "spec.goreplay.image_pull_policy must be one of {:?}, got {}",
                PULL_POLICIES, policy
            ));
        }
    }

    Ok(())
}
