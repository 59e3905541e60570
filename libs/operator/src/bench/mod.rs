pub mod controller;
pub mod reconcile;
pub mod resources;

#[cfg(test)]
mod test {
    use crate::bench::reconcile::reconcile_bench;
    use crate::conditions::Phase;
    use crate::context::Context;
    use crate::crd::bench::{Bench, BenchSpec, BenchStatus};
    use crate::crd::site::{Site, SiteSpec};
    use crate::error::Result;
    use crate::finalizer::BENCH_FINALIZER;

    use std::sync::Arc;

    use assert_json_diff::assert_json_include;
    use http::{Request, Response};
    use kube::client::Body;
    use kube::{Resource, ResourceExt};
    use serde_json::json;

    impl Bench {
        /// A fresh bench in the default namespace.
        pub fn test() -> Self {
            let mut bench = Bench::new("test", BenchSpec::default());
            bench.meta_mut().namespace = Some("default".into());
            bench
        }

        pub fn finalized(mut self) -> Self {
            self.finalizers_mut().push(BENCH_FINALIZER.to_string());
            self
        }

        pub fn needs_delete(mut self) -> Self {
            use chrono::prelude::{DateTime, TimeZone, Utc};
            use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
            let now: DateTime<Utc> = Utc.with_ymd_and_hms(2024, 7, 1, 8, 30, 0).unwrap();
            self.meta_mut().deletion_timestamp = Some(Time(now));
            self
        }

        pub fn terminating(mut self) -> Self {
            self.status = Some(BenchStatus {
                phase: Phase::Terminating,
                ..BenchStatus::default()
            });
            self
        }
    }

    fn referencing_site(bench: &str) -> Site {
        let mut site = Site::new(
            "s1",
            SiteSpec {
                bench: bench.to_string(),
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

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    pub struct ApiServerVerifier(ApiServerHandle);

    /// Scenarios with matching canned responses. A reconcile making more
    /// calls than the scenario answers shows up as a closed-service error.
    pub enum Scenario {
        /// A bench without a finalizer gets one and nothing else.
        FinalizerCreation(Bench),
        /// Deletion with dependent sites: list, status write, backoff bump.
        DeletionBlockedBySites(Bench),
        /// No API traffic expected at all.
        RadioSilence,
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
                    Scenario::FinalizerCreation(bench) => {
                        self.handle_finalizer_patch(bench).await.map(drop)
                    }
                    Scenario::DeletionBlockedBySites(bench) => {
                        self.handle_site_list(&bench)
                            .await
                            .unwrap()
                            .handle_status_get(&bench)
                            .await
                            .unwrap()
                            .handle_status_put(&bench)
                            .await
                            .unwrap()
                            .handle_backoff_bump(&bench)
                            .await
                            .map(drop)
                    }
                    Scenario::RadioSilence => Ok(()),
                }
                .expect("scenario completed without errors");
            })
        }

        async fn handle_finalizer_patch(mut self, bench: Bench) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/benches/{}?",
                    bench.name_any()
                )
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let patch: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: patch,
                expected: json!({"metadata": {"finalizers": [BENCH_FINALIZER]}})
            );
            let response = serde_json::to_vec(&bench.finalized()).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_site_list(mut self, bench: &Bench) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert!(request.uri().to_string().starts_with("/apis/frappeop.rs/v1/sites"));
            let list = json!({
                "apiVersion": "frappeop.rs/v1",
                "kind": "SiteList",
                "metadata": {"resourceVersion": "1"},
                "items": [referencing_site(&bench.name_any())]
            });
            let response = serde_json::to_vec(&list).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_get(mut self, bench: &Bench) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::GET);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/benches/{}/status?",
                    bench.name_any()
                )
            );
            let response = serde_json::to_vec(bench).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }

        async fn handle_status_put(mut self, bench: &Bench) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PUT);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/benches/{}/status?",
                    bench.name_any()
                )
            );
            let body = request.into_body().collect_bytes().await.unwrap();
            let written: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_json_include!(
                actual: written,
                expected: json!({
                    "status": {
                        "phase": "Terminating",
                        "conditions": [{
                            "type": "Terminating",
                            "status": "False",
                            "reason": "DependentSitesExist"
                        }]
                    }
                })
            );
            send.send_response(Response::builder().body(Body::from(body.to_vec())).unwrap());
            Ok(self)
        }

        async fn handle_backoff_bump(mut self, bench: &Bench) -> Result<Self> {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), http::Method::PATCH);
            assert_eq!(
                request.uri().to_string(),
                format!(
                    "/apis/frappeop.rs/v1/namespaces/default/benches/{}?",
                    bench.name_any()
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
            let response = serde_json::to_vec(bench).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            Ok(self)
        }
    }

    #[tokio::test]
    async fn bench_without_finalizer_gets_one() {
        let (ctx, handle) = Context::test();
        let bench = Bench::test();
        let mocked = ApiServerVerifier::new(handle).run(Scenario::FinalizerCreation(bench.clone()));
        let result = reconcile_bench(Arc::new(bench), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "finalizer added: {result:?}");
    }

    #[tokio::test]
    async fn deletion_is_gated_on_dependent_sites() {
        let (ctx, handle) = Context::test();
        let bench = Bench::test().finalized().needs_delete().terminating();
        let mocked =
            ApiServerVerifier::new(handle).run(Scenario::DeletionBlockedBySites(bench.clone()));
        let result = reconcile_bench(Arc::new(bench), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "deletion gate requeues: {result:?}");
    }

    #[tokio::test]
    async fn deletion_without_finalizer_is_a_no_op() {
        let (ctx, handle) = Context::test();
        let bench = Bench::test().needs_delete();
        let mocked = ApiServerVerifier::new(handle).run(Scenario::RadioSilence);
        let result = reconcile_bench(Arc::new(bench), ctx).await;
        timeout_after_1s(mocked).await;
        assert!(result.is_ok(), "no-op deletion: {result:?}");
    }
}
