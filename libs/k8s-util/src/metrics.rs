use crate::url::template_path;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::FutureExt;
use http::Request;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::{counter::Counter, family::Family, histogram::Histogram};
use prometheus_client::registry::Registry;
use tokio::time::Instant;
use tower::{Layer, Service};

// Latency buckets sized for apiserver round trips.
const LATENCY_BUCKETS: [f64; 8] = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct EndpointLabels {
    pub endpoint: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct StatusLabels {
    pub status_code: String,
}

/// Tower layer that measures every request the operator makes against the
/// Kubernetes API. Paths are templated (`{namespace}`, `{name}`) so the
/// metric cardinality stays bounded by resource kind, not object count.
pub struct ApiMetricsLayer {
    duration: Family<EndpointLabels, Histogram>,
    requests: Family<StatusLabels, Counter>,
}

impl ApiMetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        let duration = Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(LATENCY_BUCKETS.into_iter())
        });
        let requests = Family::<StatusLabels, Counter>::default();

        registry.register(
            "kubernetes_client_http_request_duration",
            "Latency of the operator's Kubernetes API requests by endpoint",
            duration.clone(),
        );
        registry.register(
            "kubernetes_client_http_requests_total",
            "Total Kubernetes API requests by status code",
            requests.clone(),
        );

        Self { duration, requests }
    }
}

impl<S> Layer<S> for ApiMetricsLayer {
    type Service = ApiMetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiMetricsService {
            inner,
            duration: self.duration.clone(),
            requests: self.requests.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiMetricsService<S> {
    inner: S,
    duration: Family<EndpointLabels, Histogram>,
    requests: Family<StatusLabels, Counter>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for ApiMetricsService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let labels = EndpointLabels {
            endpoint: url_escape::encode_path(&template_path(req.uri().path(), None)).to_string(),
        };
        let start = Instant::now();

        let fut = self.inner.call(req);
        let duration = self.duration.clone();
        let requests = self.requests.clone();
        async move {
            let result = fut.await;
            duration
                .get_or_create(&labels)
                .observe(start.elapsed().as_secs_f64());
            if let Ok(ref response) = result {
                requests
                    .get_or_create(&StatusLabels {
                        status_code: response.status().as_u16().to_string(),
                    })
                    .inc();
            }
            result
        }
        .boxed()
    }
}
