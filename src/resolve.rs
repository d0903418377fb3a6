use crate::aws::AwsContext;
use crate::error::{AwsError, ResolveError, Result, ToolkitError};
use aws_sdk_ec2::types::Filter;
use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

fn instance_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^i-[a-f0-9]+$").expect("hard-coded pattern"))
}

fn private_ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(10|127|169\.254|172\.1[6-9]|172\.2[0-9]|172\.3[0-1]|192\.168)\.")
            .expect("hard-coded pattern")
    })
}

fn ipv4_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}$")
            .expect("hard-coded pattern")
    })
}

fn private_dns_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ip-[0-9]{1,3}-[0-9]{1,3}-[0-9]{1,3}-[0-9]{1,3}\.ec2\.internal")
            .expect("hard-coded pattern")
    })
}

/// What kind of identifier a user-supplied target string looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    InstanceId,
    PrivateIp,
    PublicIp,
    PrivateDns,
    NameTag,
}

impl TargetKind {
    /// The describe-instances filter name that matches this kind of target.
    pub fn filter_name(&self) -> &'static str {
        match self {
            TargetKind::InstanceId => "instance-id",
            TargetKind::PrivateIp => "private-ip-address",
            TargetKind::PublicIp => "ip-address",
            TargetKind::PrivateDns => "private-dns-name",
            TargetKind::NameTag => "tag:Name",
        }
    }
}

/// Classify a target string. Never fails: anything that is not an instance
/// ID, IP address, or EC2-internal DNS name is treated as a Name tag value.
pub fn classify(target: &str) -> TargetKind {
    if instance_id_re().is_match(target) {
        TargetKind::InstanceId
    } else if private_ip_re().is_match(target) {
        TargetKind::PrivateIp
    } else if ipv4_re().is_match(target) {
        TargetKind::PublicIp
    } else if private_dns_re().is_match(target) {
        TargetKind::PrivateDns
    } else {
        TargetKind::NameTag
    }
}

/// Build the single describe-instances filter for a target string.
pub fn filter_for(target: &str) -> Filter {
    let kind = classify(target);
    Filter::builder()
        .name(kind.filter_name())
        .values(target)
        .build()
}

/// Apply the uniqueness policy to a set of candidate instance IDs.
pub(crate) fn select_unique(target: &str, mut candidates: Vec<String>) -> Result<String> {
    if candidates.is_empty() {
        warn!("no instance-id found for target '{}'", target);
        return Err(ResolveError::NotFound {
            target: target.to_string(),
        }
        .into());
    }

    if candidates.len() > 1 {
        return Err(ResolveError::Ambiguous {
            target: target.to_string(),
            candidates,
        }
        .into());
    }

    Ok(candidates.remove(0))
}

/// Resolve a target string to exactly one instance ID.
///
/// Targets already shaped like an instance ID are returned unchanged with no
/// API call. Everything else goes through a paginated describe-instances
/// lookup with the classifier's filter.
pub async fn resolve_instance(ctx: &AwsContext, target: &str) -> Result<String> {
    if instance_id_re().is_match(target) {
        debug!("target '{}' is already an instance ID", target);
        return Ok(target.to_string());
    }

    let filter = filter_for(target);
    debug!("describe-instances filter: {:?}", filter);

    let mut instance_ids: Vec<String> = Vec::new();
    let mut pages = ctx
        .ec2
        .describe_instances()
        .filters(filter)
        .into_paginator()
        .send();

    while let Some(page) = pages.next().await {
        let page = page.map_err(|e| AwsError::service("describe-instances", e))?;
        for reservation in page.reservations() {
            for instance in reservation.instances() {
                if let Some(id) = instance.instance_id() {
                    if !instance_ids.iter().any(|known| known == id) {
                        instance_ids.push(id.to_string());
                    }
                }
            }
        }
    }

    select_unique(target, instance_ids)
}

/// Resolve a list of targets for fleet operations.
///
/// Unresolvable targets are logged and skipped; an ambiguous target aborts
/// the whole resolution so the user can disambiguate. Returns
/// (instance ID, original target) pairs with duplicates removed.
pub async fn resolve_fleet(
    ctx: &AwsContext,
    targets: &[String],
) -> Result<Vec<(String, String)>> {
    let mut resolved: Vec<(String, String)> = Vec::new();

    for target in targets {
        match resolve_instance(ctx, target).await {
            Ok(id) => {
                if !resolved.iter().any(|(known, _)| known == &id) {
                    resolved.push((id, target.clone()));
                }
            }
            Err(ToolkitError::Resolve(ResolveError::NotFound { .. })) => {
                warn!("skipping '{}': no matching instance", target);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn private_ranges_select_private_ip_filter() {
        for target in [
            "10.0.1.5",
            "127.0.0.1",
            "169.254.12.7",
            "172.16.0.1",
            "172.19.255.4",
            "172.29.1.1",
            "172.31.0.9",
            "192.168.2.30",
        ] {
            assert_eq!(classify(target), TargetKind::PrivateIp, "{}", target);
        }
    }

    #[test]
    fn public_dotted_quads_select_ip_filter() {
        for target in ["8.8.8.8", "54.210.1.17", "172.15.0.1", "172.32.0.1"] {
            assert_eq!(classify(target), TargetKind::PublicIp, "{}", target);
        }
    }

    #[test]
    fn ec2_internal_names_select_private_dns_filter() {
        assert_eq!(
            classify("ip-10-0-1-5.ec2.internal"),
            TargetKind::PrivateDns
        );
    }

    #[test]
    fn everything_else_selects_name_tag_filter() {
        for target in ["web-server", "prod.example.com", "ip-10-0-1-5", ""] {
            assert_eq!(classify(target), TargetKind::NameTag, "{:?}", target);
        }
    }

    #[test]
    fn instance_id_shapes_are_recognized() {
        assert_eq!(classify("i-0123456789abcdef0"), TargetKind::InstanceId);
        assert_eq!(classify("i-abc123"), TargetKind::InstanceId);
        // Uppercase hex and the managed-instance prefix are not instance IDs.
        assert_eq!(classify("i-ABC123"), TargetKind::NameTag);
        assert_eq!(classify("mi-0123456789abcdef0"), TargetKind::NameTag);
    }

    #[test]
    fn filter_for_private_ip_builds_expected_filter() {
        let filter = filter_for("10.0.1.5");
        assert_eq!(filter.name(), Some("private-ip-address"));
        assert_eq!(filter.values(), ["10.0.1.5"]);
    }

    #[test]
    fn filter_for_name_builds_tag_filter() {
        let filter = filter_for("bastion");
        assert_eq!(filter.name(), Some("tag:Name"));
        assert_eq!(filter.values(), ["bastion"]);
    }

    #[test]
    fn zero_candidates_is_not_found() {
        let err = select_unique("web", Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            ToolkitError::Resolve(ResolveError::NotFound { .. })
        ));
    }

    #[test]
    fn one_candidate_is_returned() {
        let id = select_unique("web", vec!["i-aaa".to_string()]).unwrap();
        assert_eq!(id, "i-aaa");
    }

    #[test]
    fn many_candidates_is_ambiguous_with_all_listed() {
        let err = select_unique(
            "web",
            vec!["i-aaa".to_string(), "i-bbb".to_string(), "i-ccc".to_string()],
        )
        .unwrap_err();
        match err {
            ToolkitError::Resolve(ResolveError::Ambiguous { target, candidates }) => {
                assert_eq!(target, "web");
                assert_eq!(candidates, ["i-aaa", "i-bbb", "i-ccc"]);
            }
            other => panic!("expected ambiguous error, got {other:?}"),
        }
    }

    proptest! {
        /// Anything shaped like an instance ID classifies as one, which is
        /// what guarantees the resolver's zero-API-call fast path.
        #[test]
        fn instance_id_fast_path(suffix in "[a-f0-9]{1,17}") {
            let target = format!("i-{suffix}");
            prop_assert_eq!(classify(&target), TargetKind::InstanceId);
        }

        #[test]
        fn classification_is_total(target in "\\PC*") {
            // Any input maps to some filter; NameTag is the catch-all.
            let _ = classify(&target);
        }
    }
}
