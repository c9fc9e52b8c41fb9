// Copyright (C) 2024, Tony Rippy
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate log;

use std::process::ExitCode;
use std::time::Duration;

use serde::Serialize;
use tokio::runtime;

pub mod collect;
pub mod datadog;
pub mod error;
pub mod fetch;
pub mod jolokia;
pub mod registry;
pub mod zk;

use collect::{AttributeSource, FreespaceSettings, MetricsBackend, NodeMetrics, PartitionMetrics};
use datadog::DatadogClient;
use error::{Chain, RunError};
use jolokia::Jolokia;
use registry::{Node, Registry, ZkRegistry};

/// One run's snapshot of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub partitions: PartitionMetrics,
    pub brokers: NodeMetrics,
}

pub trait Exporter {
    fn export(&mut self, report: &Report) -> std::io::Result<()>;
}

pub trait Args {
    fn api_key(&self) -> &str;
    fn app_key(&self) -> &str;

    /// Base URL of the metrics backend's API.
    fn api_url(&self) -> &str;

    /// ZooKeeper connect string, optionally with a chroot.
    fn zk_addr(&self) -> &str;

    /// Path under which Kafka keeps its metadata.
    fn zk_prefix(&self) -> &str;

    fn jolokia_port(&self) -> u16;
    fn include_unavailable(&self) -> bool;
    fn freespace(&self) -> FreespaceSettings;

    /// Limit on every remote call.
    fn query_timeout(&self) -> Duration;

    fn verbose(&self) -> bool;
}

/// Lists the brokers. A listing that produced nothing but errors is fatal;
/// an empty cluster is not.
pub async fn list_nodes<R: Registry>(
    registry: &mut R,
    include_unavailable: bool,
) -> Result<Vec<Node>, RunError> {
    let (nodes, errors) = registry.list_nodes(include_unavailable).await;
    if nodes.is_empty() && !errors.is_empty() {
        return Err(RunError::NoNodes(errors));
    }
    for err in errors.iter() {
        warn!("{}", Chain(err));
    }
    info!("found {} brokers", nodes.len());
    Ok(nodes)
}

pub async fn collect_report<S: AttributeSource, B: MetricsBackend>(
    nodes: &[Node],
    source: &S,
    backend: &B,
    settings: &FreespaceSettings,
) -> Result<Report, RunError> {
    let partitions = collect::collect_partition_sizes(nodes, source).await;
    let brokers = collect::collect_node_freespace(nodes, backend, settings)
        .await
        .map_err(RunError::Freespace)?;
    Ok(Report {
        partitions,
        brokers,
    })
}

async fn run_async(args: &impl Args, exporter: &mut dyn Exporter) -> Result<(), RunError> {
    let timeout = args.query_timeout();
    let backend = DatadogClient::new(args.api_url(), args.api_key(), args.app_key(), timeout)?;
    match backend.validate_credentials().await {
        Ok(true) => debug!("API credentials are valid"),
        Ok(false) => return Err(RunError::InvalidCredentials),
        Err(err) => return Err(RunError::Validate(err)),
    }

    let mut registry = ZkRegistry::connect(args.zk_addr(), args.zk_prefix(), timeout).await?;
    let nodes = list_nodes(&mut registry, args.include_unavailable()).await;
    if let Err(err) = registry.close().await {
        warn!("unable to close ZooKeeper session: {}", Chain(&err));
    }
    let nodes = nodes?;

    let jolokia = Jolokia::new(args.jolokia_port(), timeout);
    let report = collect_report(&nodes, &jolokia, &backend, &args.freespace()).await?;
    info!(
        "collected {} topics and {} brokers",
        report.partitions.len(),
        report.brokers.len()
    );
    if args.verbose() {
        if let Ok(text) = serde_json::to_string_pretty(&report) {
            info!("report:\n{}", text);
        }
    }

    exporter.export(&report)?;
    Ok(())
}

pub fn run(args: &impl Args, mut exporter: Box<dyn Exporter>) -> ExitCode {
    let rt = match runtime::Builder::new_current_thread()
        .enable_time()
        .enable_io()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!("error building runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };
    match rt.block_on(run_async(args, exporter.as_mut())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::NoNodes(errors)) => {
            for err in errors.iter() {
                error!("{}", Chain(err));
            }
            error!("no brokers could be listed");
            ExitCode::FAILURE
        }
        Err(err) => {
            error!("{}", Chain(&err));
            ExitCode::FAILURE
        }
    }
}
