use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use frappeop_k8s_util::client::instrumented_client;
use frappeop_operator::backup::controller as backup_controller;
use frappeop_operator::bench::controller as bench_controller;
use frappeop_operator::config::ControllerConfig;
use frappeop_operator::context::{ClusterFacts, State};
use frappeop_operator::site::controller as site_controller;
use frappeop_operator::telemetry;

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="frappeop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Per-controller reconcile parallelism (1-64)
    #[arg(short, long, default_value_t = 4, env)]
    concurrency: u16,

    /// Namespace holding the operator's ConfigMap
    #[arg(long, default_value = "frappeop-system", env = "OPERATOR_NAMESPACE")]
    operator_namespace: String,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,frappeop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint. Tracing is disabled when
    /// unset.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing; 1.0 samples everything.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let mut registry = Registry::with_prefix("frappeop");
    let config = Config::infer().await?;
    let client = instrumented_client(config, &mut registry).await?;

    let controller_config = ControllerConfig::load(&client, &args.operator_namespace).await;
    let facts = ClusterFacts::discover(&client).await;
    tracing::info!(platform = %facts.platform, msg = "discovered cluster facts");

    let controllers = [
        bench_controller::CONTROLLER_ID,
        site_controller::CONTROLLER_ID,
        backup_controller::BACKUP_CONTROLLER_ID,
        backup_controller::RESTORE_CONTROLLER_ID,
    ];
    let state = State::new(registry, controller_config, facts, &controllers);

    let concurrency = args.concurrency.clamp(1, 64);
    let benches = bench_controller::run(state.clone(), client.clone(), concurrency);
    let sites = site_controller::run(state.clone(), client.clone(), concurrency);
    let backups = backup_controller::run_backups(state.clone(), client.clone(), concurrency);
    let restores = backup_controller::run_restores(state.clone(), client.clone(), concurrency);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Every runtime implements graceful shutdown; poll until all are done
    tokio::join!(benches, sites, backups, restores, server.run()).4?;
    Ok(())
}
