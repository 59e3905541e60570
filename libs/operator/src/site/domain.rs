//! Effective-domain resolution. Strictly priority-ordered: explicit spec
//! domain, bench suffix, cluster autodetection, then the site name itself.
//! Pure over a supplied Service list so the rules are testable offline.

use crate::crd::site::DomainSource;

use k8s_openapi::api::core::v1::Service;

/// Annotation ingress controllers use to advertise their wildcard hostname.
pub const EXTERNAL_DNS_HOSTNAME_ANNOTATION: &str = "external-dns.alpha.kubernetes.io/hostname";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedDomain {
    pub domain: String,
    pub source: DomainSource,
}

/// Format-level IPv4 check: four dot-separated digit-only groups. Octet
/// ranges are deliberately not validated ("256.1.1.1" passes); callers must
/// not use this for input validation.
pub fn is_ip_address(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| !g.is_empty() && g.chars().all(|c| c.is_ascii_digit()))
}

/// Dot-prefixed registrable suffix of a hostname: the last two labels.
/// Empty for IPs, single-label hosts and the empty string. A two-label host
/// returns itself dot-prefixed.
pub fn extract_domain_suffix(host: &str) -> String {
    if host.is_empty() || is_ip_address(host) {
        return String::new();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() < 2 {
        return String::new();
    }
    format!(".{}", labels[labels.len() - 2..].join("."))
}

/// Names that never leave the cluster; autodetection is skipped for them.
pub fn is_local_only(name: &str) -> bool {
    name == "localhost" || name.ends_with(".local") || name.ends_with(".localhost")
}

/// Find a usable domain suffix from the namespace's services: the
/// external-dns annotation first, then load-balancer ingress hostnames
/// (addresses that are plain IPs contribute nothing).
pub fn detect_cluster_suffix(services: &[Service]) -> Option<String> {
    for service in services {
        if let Some(hostname) = service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(EXTERNAL_DNS_HOSTNAME_ANNOTATION))
        {
            let suffix = extract_domain_suffix(hostname);
            if !suffix.is_empty() {
                return Some(suffix);
            }
        }
    }
    for service in services {
        let ingresses = service
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref());
        for ingress in ingresses.into_iter().flatten() {
            if let Some(hostname) = &ingress.hostname {
                if is_ip_address(hostname) {
                    continue;
                }
                let suffix = extract_domain_suffix(hostname);
                if !suffix.is_empty() {
                    return Some(suffix);
                }
            }
        }
    }
    None
}

pub fn resolve_domain(
    site_name: &str,
    explicit: Option<&str>,
    bench_suffix: Option<&str>,
    autodetect: bool,
    services: &[Service],
) -> ResolvedDomain {
    if let Some(domain) = explicit.filter(|d| !d.is_empty()) {
        return ResolvedDomain {
            domain: domain.to_string(),
            source: DomainSource::Explicit,
        };
    }
    if let Some(suffix) = bench_suffix.filter(|s| !s.is_empty()) {
        let suffix = if suffix.starts_with('.') {
            suffix.to_string()
        } else {
            format!(".{suffix}")
        };
        return ResolvedDomain {
            domain: format!("{site_name}{suffix}"),
            source: DomainSource::BenchSuffix,
        };
    }
    if autodetect && !is_local_only(site_name) {
        if let Some(suffix) = detect_cluster_suffix(services) {
            return ResolvedDomain {
                domain: format!("{site_name}{suffix}"),
                source: DomainSource::AutoDetected,
            };
        }
    }
    ResolvedDomain {
        domain: site_name.to_string(),
        source: DomainSource::SitenameDefault,
    }
}
