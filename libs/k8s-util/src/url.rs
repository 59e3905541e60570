/// Rewrite a Kubernetes API path into its route template, replacing object
/// names and namespaces with `{name}` / `{namespace}` placeholders. Follows
/// the shape of client-go's `templatePath` so metric labels line up with
/// what kubernetes tooling reports.
pub fn template_path(path: &str, base_path: Option<&str>) -> String {
    let (prefix, rest) = match base_path {
        Some(base) if path.starts_with(base) => (base.trim_end_matches('/'), &path[base.len()..]),
        _ => ("", path),
    };

    let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() <= 2 {
        return path.to_owned();
    }

    // Segments up to and including the version: /api/v1 or /apis/<group>/<version>.
    let version_end = match segments[0] {
        "api" => 2,
        "apis" => 3,
        _ => return "/{prefix}".to_owned(),
    };

    let is_subresource = |s: &str| s == "status" || s == "finalize";
    match segments.len() - version_end {
        // /<resource> — cluster-scoped collection, nothing to template
        1 => {}
        // /<resource>/<name>
        2 => segments[version_end + 1] = "{name}",
        3 => {
            if is_subresource(segments[version_end + 2]) {
                // /<resource>/<name>/<subresource>
                segments[version_end + 1] = "{name}";
            } else {
                // /namespaces/<namespace>/<resource>
                segments[version_end + 1] = "{namespace}";
            }
        }
        // /namespaces/<namespace>/<resource>/<name>[/<subresource>]
        _ => {
            segments[version_end + 1] = "{namespace}";
            if !is_subresource(segments[version_end + 3]) {
                segments[version_end + 3] = "{name}";
            }
        }
    }

    format!("{}/{}", prefix, segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_path_passes_through() {
        assert_eq!(template_path("/", None), "/");
    }

    #[test]
    fn core_group_name() {
        assert_eq!(template_path("/api/v1/pods/web-0", None), "/api/v1/pods/{name}");
    }

    #[test]
    fn namespaced_collection() {
        assert_eq!(
            template_path("/api/v1/namespaces/tenants/secrets", None),
            "/api/v1/namespaces/{namespace}/secrets"
        );
    }

    #[test]
    fn crd_with_namespace_and_name() {
        assert_eq!(
            template_path("/apis/frappeop.rs/v1/namespaces/tenants/benches/b1", None),
            "/apis/frappeop.rs/v1/namespaces/{namespace}/benches/{name}"
        );
    }

    #[test]
    fn status_subresource() {
        assert_eq!(
            template_path("/apis/frappeop.rs/v1/namespaces/tenants/sites/s1/status", None),
            "/apis/frappeop.rs/v1/namespaces/{namespace}/sites/{name}/status"
        );
    }

    #[test]
    fn finalize_subresource_without_namespace() {
        assert_eq!(
            template_path("/apis/frappeop.rs/v1/benches/b1/finalize", None),
            "/apis/frappeop.rs/v1/benches/{name}/finalize"
        );
    }

    #[test]
    fn unknown_prefix_collapses() {
        assert_eq!(template_path("/healthz/ready/verbose", None), "/{prefix}");
    }

    #[test]
    fn base_path_is_preserved() {
        assert_eq!(
            template_path("/k8s/clusters/c1/api/v1/pods/web-0", Some("/k8s/clusters/c1")),
            "/k8s/clusters/c1/api/v1/pods/{name}"
        );
    }

    #[test]
    fn query_string_is_folded_into_name() {
        assert_eq!(
            template_path(
                "/apis/batch/v1/namespaces/tenants/jobs/s1-init?limit=1",
                None
            ),
            "/apis/batch/v1/namespaces/{namespace}/jobs/{name}"
        );
    }

    #[test]
    fn short_paths_pass_through() {
        assert_eq!(template_path("/api/v1", None), "/api/v1");
    }
}
