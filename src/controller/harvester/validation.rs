use crate::crd::harvester::HarvesterSpec;

/// Validate a Harvester spec
///
/// Checks the runtime constraints the CRD schema cannot express:
/// - `segment` in 0-100
/// - `app_port` a valid TCP port
/// - `refinery` a non-empty DNS label (it becomes part of a service hostname)
///
/// The selector is not checked here; an unusable selector makes reconcile a no-op.
pub fn validate_harvester(spec: &HarvesterSpec) -> Result<(), String> {
    if !(0..=100).contains(&spec.segment_size) {
        return Err(format!(
            "spec.segment must be 0-100, got {}",
            spec.segment_size
        ));
    }

    if !(1..=65535).contains(&spec.app_port) {
        return Err(format!(
            "spec.app_port must be 1-65535, got {}",
            spec.app_port
        ));
    }

    if spec.refinery.is_empty() {
        return Err("spec.refinery cannot be empty".to_string());
    }

    let dns_label = spec.refinery.len() <= 63
        && spec
            .refinery
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !spec.refinery.starts_with('-')
        && !spec.refinery.ends_with('-');
    if !dns_label {
        return Err(format!(
            "spec.refinery must be a DNS label, got {:?}",
            spec.refinery
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn spec(segment_size: i32, app_port: i32, refinery: &str) -> HarvesterSpec {
        HarvesterSpec {
            selector: BTreeMap::from([("app".to_string(), "web".to_string())]),
            app_port,
            refinery: refinery.to_string(),
            segment_size,
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(validate_harvester(&spec(30, 8080, "shop-refinery")).is_ok());
        assert!(validate_harvester(&spec(0, 1, "r")).is_ok());
        assert!(validate_harvester(&spec(100, 65535, "r1")).is_ok());
    }

    #[test]
    fn test_segment_size_out_of_range() {
        let err = validate_harvester(&spec(101, 8080, "r")).unwrap_err();
        assert!(err.contains("segment"));
        assert!(validate_harvester(&spec(-1, 8080, "r")).is_err());
    }

    #[test]
    fn test_app_port_out_of_range() {
        assert!(validate_harvester(&spec(30, 0, "r")).is_err());
        assert!(validate_harvester(&spec(30, 70000, "r")).is_err());
    }

    #[test]
    fn test_refinery_must_be_dns_label() {
        assert!(validate_harvester(&spec(30, 8080, "")).is_err());
        assert!(validate_harvester(&spec(30, 8080, "Shop")).is_err());
        assert!(validate_harvester(&spec(30, 8080, "shop.refinery")).is_err());
        assert!(validate_harvester(&spec(30, 8080, "-shop")).is_err());
    }
}
