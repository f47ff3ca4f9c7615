use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Port of the Prometheus scrape endpoint started by [`init_metrics`].
pub const METRICS_PORT: u16 = 9000;

/// Label attached to every metric with the name of the running pipeline.
pub const PIPELINE_LABEL: &str = "pipeline";

/// Installs the global Prometheus recorder and serves `[::]:9000/metrics`.
///
/// Every metric recorded afterwards carries the `pipeline` label when `pipeline` is set. Fails if
/// a recorder was already installed or the port cannot be bound.
pub fn init_metrics(pipeline: Option<&str>) -> Result<(), BuildError> {
    let mut builder = PrometheusBuilder::new().with_http_listener(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        METRICS_PORT,
    ));

    if let Some(pipeline) = pipeline {
        builder = builder.add_global_label(PIPELINE_LABEL, pipeline);
    }

    builder.install()?;

    Ok(())
}
