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

//! The two collectors: partition sizes from each broker's Jolokia agent, and
//! broker free space from the metrics backend.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use crate::datadog::Series;
use crate::error::{Chain, CollectError, ExtractError};
use crate::jolokia::{AttributeTree, AttributeValue};
use crate::registry::Node;

/// The MBean pattern matching every partition's log size.
pub const LOG_SIZE_PATTERN: &str = "kafka.log:type=Log,name=Size,*";

pub const SIZE_METRIC: &str = "Size";
pub const STORAGE_FREE_METRIC: &str = "StorageFree";

/// topic -> partition -> metric -> value
pub type PartitionMetrics = BTreeMap<String, BTreeMap<String, BTreeMap<String, f64>>>;

/// broker id -> metric -> value
pub type NodeMetrics = BTreeMap<String, BTreeMap<String, f64>>;

/// Reads JMX attributes from a broker.
#[allow(async_fn_in_trait)]
pub trait AttributeSource {
    async fn read_attribute(&self, node: &Node, pattern: &str)
        -> Result<AttributeTree, CollectError>;
}

/// A timeseries query service.
#[allow(async_fn_in_trait)]
pub trait MetricsBackend {
    async fn validate_credentials(&self) -> Result<bool, CollectError>;

    /// Runs `query` over `[start, end]`, both in seconds since the epoch.
    async fn query_range(&self, start: i64, end: i64, query: &str)
        -> Result<Vec<Series>, CollectError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: String,
}

fn topic_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r".*topic=([^,]+)").expect("valid topic pattern"))
}

fn partition_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r".*partition=(\d+)").expect("valid partition pattern"))
}

/// Recovers the topic and partition from an MBean name such as
/// `kafka.log:name=Size,partition=97,topic=audit-logs,type=Log`.
/// Both must be present.
pub fn extract_topic_partition(name: &str) -> Result<TopicPartition, ExtractError> {
    let capture = |re: &Regex| {
        re.captures(name)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    };
    match (capture(topic_pattern()), capture(partition_pattern())) {
        (Some(topic), Some(partition)) => Ok(TopicPartition { topic, partition }),
        (topic, partition) => Err(ExtractError {
            name: name.to_string(),
            topic_missing: topic.is_none(),
            partition_missing: partition.is_none(),
        }),
    }
}

fn decode_entry(
    name: &str,
    value: &serde_json::Value,
) -> Result<(TopicPartition, f64), CollectError> {
    let tp = extract_topic_partition(name)?;
    let size = AttributeValue::decode(value)?;
    Ok((tp, size.value))
}

/// Folds every broker's log sizes into topic -> partition -> {"Size": bytes}.
///
/// A broker whose query fails is logged and skipped; whatever was already
/// collected from the other brokers is kept. Entries whose name or value
/// can't be decoded are skipped with a warning.
pub async fn collect_partition_sizes<S: AttributeSource>(
    nodes: &[Node],
    source: &S,
) -> PartitionMetrics {
    let mut metrics = PartitionMetrics::new();
    for node in nodes {
        let tree = match source.read_attribute(node, LOG_SIZE_PATTERN).await {
            Ok(tree) => tree,
            Err(err) => {
                error!(
                    "broker {} ({}): unable to read partition sizes: {}",
                    node.id,
                    node.host,
                    Chain(&err)
                );
                continue;
            }
        };
        debug!("broker {}: {} log size attributes", node.id, tree.len());
        for (name, value) in tree.iter() {
            match decode_entry(name, value) {
                Ok((tp, size)) => {
                    metrics
                        .entry(tp.topic)
                        .or_default()
                        .insert(tp.partition, BTreeMap::from([(SIZE_METRIC.to_string(), size)]));
                }
                Err(err) => warn!("broker {}: skipping {:?}: {}", node.id, name, Chain(&err)),
            }
        }
    }
    metrics
}

/// What to do when a single broker's free space can't be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log the failure and leave the broker out.
    #[default]
    BestEffort,
    /// Abort the whole collection.
    FailFast,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best-effort" => Ok(FailurePolicy::BestEffort),
            "fail-fast" => Ok(FailurePolicy::FailFast),
            _ => Err(format!("unknown failure policy {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FreespaceSettings {
    /// Aggregation applied across the host's disks, e.g. "sum" or "max".
    pub aggregation: String,
    pub window: Duration,
    pub policy: FailurePolicy,
}

impl Default for FreespaceSettings {
    fn default() -> Self {
        Self {
            aggregation: "sum".to_string(),
            window: Duration::from_secs(60),
            policy: FailurePolicy::BestEffort,
        }
    }
}

impl FreespaceSettings {
    pub fn query_for(&self, host: &str) -> String {
        format!("{}:system.disk.free{{host:{}}}", self.aggregation, host)
    }
}

/// The most recent non-null point of the first series.
pub fn latest_value(series: &[Series]) -> Option<f64> {
    series
        .first()?
        .pointlist
        .iter()
        .rev()
        .find_map(|(_, value)| *value)
}

async fn node_freespace<B: MetricsBackend>(
    node: &Node,
    backend: &B,
    settings: &FreespaceSettings,
) -> Result<f64, CollectError> {
    let end = Utc::now().timestamp();
    let start = i64::try_from(settings.window.as_secs())
        .ok()
        .and_then(|window| end.checked_sub(window))
        .filter(|start| *start >= 0)
        .ok_or(CollectError::Window(settings.window))?;
    let query = settings.query_for(&node.host);
    debug!("broker {}: querying {} over [{}, {}]", node.id, query, start, end);
    let series = backend.query_range(start, end, &query).await?;
    latest_value(&series).ok_or(CollectError::NoData { node: node.id })
}

/// Folds every broker's current free disk space into
/// broker id -> {"StorageFree": bytes}.
pub async fn collect_node_freespace<B: MetricsBackend>(
    nodes: &[Node],
    backend: &B,
    settings: &FreespaceSettings,
) -> Result<NodeMetrics, CollectError> {
    let mut metrics = NodeMetrics::new();
    for node in nodes {
        match node_freespace(node, backend, settings).await {
            Ok(free) => {
                metrics.insert(
                    node.id.to_string(),
                    BTreeMap::from([(STORAGE_FREE_METRIC.to_string(), free)]),
                );
            }
            Err(err) if settings.policy == FailurePolicy::FailFast => return Err(err),
            Err(err) => error!(
                "broker {} ({}): unable to read free space: {}",
                node.id,
                node.host,
                Chain(&err)
            ),
        }
    }
    Ok(metrics)
}
