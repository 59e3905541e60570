#[cfg(all(test, feature = "e2e-tests"))]
mod test {
    use std::time::Duration;

    use frappeop_operator::conditions::Phase;
    use frappeop_operator::crd::bench::{Bench, BenchSpec};
    use frappeop_operator::crd::site::{Site, SiteSpec};
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::batch::v1::Job;
    use kube::api::{Api, PostParams};
    use kube::client::Client;
    use kube::runtime::wait::{await_condition, conditions, Condition};
    use kube::ResourceExt;
    use tokio::time::timeout;

    fn phase_is<K, F>(extract: F, phase: Phase) -> impl Condition<K>
    where
        F: Fn(&K) -> Option<Phase>,
    {
        move |obj: Option<&K>| obj.and_then(|o| extract(o)) == Some(phase)
    }

    fn bench_phase(bench: &Bench) -> Option<Phase> {
        bench.status.as_ref().map(|s| s.phase)
    }

    fn site_phase(site: &Site) -> Option<Phase> {
        site.status.as_ref().map(|s| s.phase)
    }

    async fn wait_for<R, C>(api: Api<R>, name: &str, condition: C, secs: u64)
    where
        R: kube::Resource
            + Clone
            + std::fmt::Debug
            + for<'de> k8s_openapi::serde::Deserialize<'de>
            + 'static
            + Send,
        C: Condition<R>,
    {
        timeout(
            Duration::from_secs(secs),
            await_condition(api, name, condition),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn setup_bench(name: &str) -> (Client, Api<Bench>) {
        let client = Client::try_default().await.unwrap();
        let benches = Api::<Bench>::namespaced(client.clone(), "default");
        benches
            .create(&PostParams::default(), &Bench::new(name, BenchSpec::default()))
            .await
            .unwrap();
        wait_for(
            benches.clone(),
            name,
            phase_is(bench_phase, Phase::Ready),
            300,
        )
        .await;
        (client, benches)
    }

    fn site_for(bench: &str, name: &str) -> Site {
        Site::new(
            name,
            SiteSpec {
                bench: bench.to_string(),
                site_name: format!("{name}.local"),
                domain: None,
                db: None,
                ingress: Default::default(),
                tls: Default::default(),
                admin_password_secret: None,
                apps: vec![],
            },
        )
    }

    #[tokio::test]
    async fn bench_becomes_ready_with_all_components() {
        let name = "e2e-bench-ready";
        let (client, benches) = setup_bench(name).await;

        let deployments = Api::<Deployment>::namespaced(client, "default");
        for component in ["web", "nginx", "socketio", "scheduler"] {
            deployments
                .get(&format!("{name}-{component}"))
                .await
                .unwrap();
        }
        benches.delete(name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn site_initializes_on_a_ready_bench() {
        let bench_name = "e2e-bench-site";
        let site_name = "e2e-site";
        let (client, benches) = setup_bench(bench_name).await;

        let sites = Api::<Site>::namespaced(client.clone(), "default");
        sites
            .create(&PostParams::default(), &site_for(bench_name, site_name))
            .await
            .unwrap();
        wait_for(sites.clone(), site_name, phase_is(site_phase, Phase::Ready), 600).await;

        let jobs = Api::<Job>::namespaced(client, "default");
        let init = jobs.get(&format!("{site_name}-init")).await.unwrap();
        assert!(init.status.unwrap().succeeded.unwrap_or(0) > 0);

        let site = sites.get(site_name).await.unwrap();
        sites.delete(site_name, &Default::default()).await.unwrap();
        wait_for(
            sites.clone(),
            site_name,
            conditions::is_deleted(&site.uid().unwrap()),
            600,
        )
        .await;
        benches.delete(bench_name, &Default::default()).await.unwrap();
    }

    #[tokio::test]
    async fn bench_deletion_is_blocked_by_sites() {
        let bench_name = "e2e-bench-blocked";
        let site_name = "e2e-site-blocker";
        let (_client, benches) = setup_bench(bench_name).await;

        let sites = Api::<Site>::namespaced(
            Client::try_default().await.unwrap(),
            "default",
        );
        sites
            .create(&PostParams::default(), &site_for(bench_name, site_name))
            .await
            .unwrap();
        wait_for(sites.clone(), site_name, phase_is(site_phase, Phase::Ready), 600).await;

        benches.delete(bench_name, &Default::default()).await.unwrap();

        // the bench must survive while the site references it
        tokio::time::sleep(Duration::from_secs(30)).await;
        let blocked = benches.get(bench_name).await.unwrap();
        let terminating = blocked
            .status
            .unwrap()
            .conditions
            .unwrap()
            .into_iter()
            .find(|c| c.type_ == "Terminating")
            .unwrap();
        assert_eq!(terminating.reason, "DependentSitesExist");

        let site = sites.get(site_name).await.unwrap();
        sites.delete(site_name, &Default::default()).await.unwrap();
        wait_for(
            sites,
            site_name,
            conditions::is_deleted(&site.uid().unwrap()),
            600,
        )
        .await;
        wait_for(
            benches.clone(),
            bench_name,
            |obj: Option<&Bench>| obj.is_none(),
            600,
        )
        .await;
    }
}
