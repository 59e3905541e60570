pub mod controller;
pub mod database;
pub mod domain;
pub mod jobs;
pub mod reconcile;
pub mod resources;

#[cfg(test)]
mod test {
    use crate::context::Context;
    use crate::crd::site::{Site, SiteSpec};
    use crate::error::Result;
    use crate::finalizer::SITE_FINALIZER;
    use crate::site::reconcile::reconcile_site;

    use std::sync::Arc;

    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use kube::client::Body;
    use kube::{Resource, ResourceExt};
    use serde_json::json;

    impl Site {
        pub fn test() -> Self {
            let mut site = Site::new(
                "s1",
                SiteSpec {
                    bench: "b1".into(),
                    site_name: "acme".into(),
                    domain: None,
                    db: None,
                    ingress: Default::default(),
                    tls: Default::default(),
                    admin_password_secret: None,
                    apps: vec![],
                },
            );
            site.meta_mut().namespace = Some("default".into());
            site
        }

        pub fn finalized(mut self) -> Self {
            self.finalizers_mut().push(SITE_FINALIZER.to_string());
            self
        }

        pub fn without_bench_ref(mut self) -> Self {
            self.spec.bench = String::new();
            self
        }
    }

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(ApiServerHandle);

    pub enum Scenario {
        /// A new site gets the finalizer and nothing else this pass.
        FinalizerCreation(Site),
        /// The referenced bench does not exist: status + backoff, no jobs.
        BenchMissing(Site),
        /// Missing benchRef: phase goes Failed with events, no retry patch.
        ValidationFailure(Site),
    }

    pub async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    impl ApiServerVerifier {
        pub fn new(handle: ApiServerHandle) -> Self {
            Self(handle)
        }

        pub fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::FinalizerCreation(site) => {
                        self.handle_finalizer_patch(site).await.map(drop)
                    }
                    Scenario::BenchMissing(site) => {
                        self.handle_metadata_list()
                            .await
                            .unwrap()
                            .handle_bench_get_not_found(&site)
                            .await
                            .unwrap()
                            .handle_status_get(&site)
                            .await
                            .unwrap()
                            .handle_status_put(&site, "Pending", "BenchNotFound")
                            .await
                            .unwrap()
                            .handle_backoff_bump(&site)
                            .await
                            .map(drop)
                    }
                    Scenario::ValidationFailure(site) => {
                        self.handle_metadata_list()
                            .await
                            .unwrap()
                            .handle_status_get(&site)
                            .await
                            .unwrap()
                            .handle_status_put(&site, "Failed", "ValidationFailed")
                            .await
                            .unwrap()
                            .handle_event_post()
                            .await
                            .unwrap()
                            .handle_event_post()
                            .await
                            .map(drop)
                    }
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_patch(mut self, site: Site) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/sites/{}?",
                    site.name_any()
                )
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let patch: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: patch,
                expected: json!({"metadata": {"finalizers": [SITE_FINALIZER]}})
            );
            let response = serde_json::to_vec(&site.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        /// The resource-totals gauge tolerates list errors; feed it one.
        async fn handle_metadata_list(mut self) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request
                .uri()
                .to_string()
                .starts_with("/apis/frappeop.rs/v1/namespaces/default/sites"));
            send.send_response(
                Response::builder()
                    .status(500)
                    .body(Body::empty())
                    .unwrap(),
            );
            Ok(self)
        }

        async fn handle_bench_get_not_found(mut self, _site: &Site) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request
                .uri()
                .to_string()
                .starts_with("/apis/frappeop.rs/v1/namespaces/default/benches/b1"));
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "benches.frappeop.rs \"b1\" not found",
                "reason": "NotFound",
                "code": 404
            });
            send.send_response(
                Response::builder()
                    .status(404)
                    .body(Body::from(serde_json::to_vec(&status).unwrap()))
                    .unwrap(),
            );
            Ok(self)
        }

        async fn handle_status_get(mut self, site: &Site) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/sites/{}/status?",
                    site.name_any()
                )
            );
            let response = serde_json::to_vec(site).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_put(mut self, site: &Site, phase: &str, reason: &str) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PUT);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/sites/{}/status?",
                    site.name_any()
                )
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let written: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(written["status"]["phase"], phase);
            let reasons: Vec<&str> = written["status"]["conditions"]
                .as_array()
                .unwrap()
                .iter()
                .filter_map(|c| c["reason"].as_str())
                .collect();
            assert!(reasons.contains(&reason), "{reasons:?} misses {reason}");
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
            Ok(self)
        }

        async fn handle_event_post(mut self) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::POST);
            assert!(request.uri().to_string().contains("/events"));
            let body = request.into_body().collect_bytes().await.unwrap();
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
            Ok(self)
        }

        async fn handle_backoff_bump(mut self, site: &Site) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/sites/{}?",
                    site.name_any()
                )
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let patch: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: patch,
                expected: json!({
                    "metadata": {"annotations": {"frappeop.rs/requeue-attempt": "1"}}
                })
            );
            let response = serde_json::to_vec(site).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    #[tokio::test]
    async fn site_without_finalizer_gets_one() {
        let (ctx, handle) = Context::test();
        let site = Site::test();
        let mocked = ApiServerVerifier::new(handle).run(Scenario::FinalizerCreation(site.clone()));
        let result = reconcile_site(Arc::new(site), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "finalizer added: {result:?}");
    }

    #[tokio::test]
    async fn missing_bench_gates_the_site() {
        let (ctx, handle) = Context::test();
        let site = Site::test().finalized();
        let mocked = ApiServerVerifier::new(handle).run(Scenario::BenchMissing(site.clone()));
        let result = reconcile_site(Arc::new(site), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "bench gate requeues: {result:?}");
    }

    #[tokio::test]
    async fn missing_bench_ref_fails_validation() {
        let (ctx, handle) = Context::test();
        let site = Site::test().finalized().without_bench_ref();
        let mocked = ApiServerVerifier::new(handle).run(Scenario::ValidationFailure(site.clone()));
        let result = reconcile_site(Arc::new(site), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "validation failure halts: {result:?}");
    }
}
