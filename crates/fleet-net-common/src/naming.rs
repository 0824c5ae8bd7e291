//! Object naming shared by the hub and member agents
//!
//! Every name here is part of the cross-cluster contract: the member agent
//! writes a claim under one name and the hub finds it under the same name.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::{Error, Result};

/// Prefix of the per-member reserved namespace in the hub cluster
pub const HUB_NAMESPACE_PREFIX: &str = "fleet-member-";

/// Prefix of Azure Traffic Manager profile and endpoint names
pub const TRAFFIC_MANAGER_NAME_PREFIX: &str = "fleet-";

/// Separator between the segments of a Traffic Manager endpoint name
pub const ENDPOINT_NAME_SEPARATOR: char = '#';

/// Maximum length of an RFC 1123 DNS label
pub const DNS_LABEL_MAX_LENGTH: usize = 63;

const UNIQUE_SUFFIX_LENGTH: usize = 8;

/// Name of the hub claim for `{namespace}/{name}`
pub fn claim_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}

/// Reserved hub namespace of a member cluster
pub fn hub_namespace(member_cluster: &str) -> String {
    format!("{HUB_NAMESPACE_PREFIX}{member_cluster}")
}

/// Azure resource name of the Traffic Manager profile for a TrafficManagerProfile UID
pub fn traffic_manager_profile_name(profile_uid: &str) -> String {
    format!("{TRAFFIC_MANAGER_NAME_PREFIX}{profile_uid}")
}

/// DNS relative name of a Traffic Manager profile; the FQDN is `{this}.trafficmanager.net`
pub fn traffic_manager_dns_relative_name(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}")
}

/// Prefix shared by every endpoint a TrafficManagerBackend owns
pub fn traffic_manager_endpoint_prefix(backend_uid: &str) -> String {
    format!("{TRAFFIC_MANAGER_NAME_PREFIX}{backend_uid}{ENDPOINT_NAME_SEPARATOR}")
}

/// Endpoint name for one exporting cluster of a ServiceImport
///
/// Azure treats endpoint names case-insensitively and returns them
/// lowercased, so the name is lowercased here too.
pub fn traffic_manager_endpoint_name(
    backend_uid: &str,
    service_import: &str,
    cluster_id: &str,
) -> String {
    format!(
        "{}{service_import}{ENDPOINT_NAME_SEPARATOR}{cluster_id}",
        traffic_manager_endpoint_prefix(backend_uid)
    )
    .to_lowercase()
}

/// Fleet-unique RFC 1123 DNS label for an object exported from a member cluster
///
/// Format is `{cluster}-{namespace}-{name}-{suffix}` with an 8 character
/// random lowercase alphanumeric suffix. Each of the three leading segments
/// is truncated so the result fits in 63 characters, and dots are removed.
pub fn cluster_scoped_name(cluster: &str, namespace: &str, name: &str) -> Result<String> {
    let reserved = 3 + UNIQUE_SUFFIX_LENGTH;
    let per_segment = (DNS_LABEL_MAX_LENGTH - reserved) / 3;

    let segment = |s: &str| -> String {
        s.chars()
            .filter(|c| *c != '.')
            .take(per_segment)
            .collect::<String>()
    };
    let unique = format!(
        "{}-{}-{}-{}",
        segment(cluster),
        segment(namespace),
        segment(name),
        random_suffix(UNIQUE_SUFFIX_LENGTH)
    );

    if !is_dns1123_label(&unique) {
        return Err(Error::validation_for(
            format!("{cluster}/{namespace}/{name}"),
            format!("cannot format a unique DNS label name, got {unique:?}"),
        ));
    }
    Ok(unique)
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|b| (b as char).to_ascii_lowercase())
        .take(len)
        .collect()
}

fn is_dns1123_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= DNS_LABEL_MAX_LENGTH
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}
