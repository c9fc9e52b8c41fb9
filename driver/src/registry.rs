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

use std::time::Duration;

use serde::Deserialize;

use crate::error::{RegistryError, ZkError};
use crate::zk;

/// A broker as registered in the cluster metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: i32,
    pub host: String,
    pub port: Option<u16>,
    pub rack: Option<String>,
}

impl Node {
    pub fn new(id: i32, host: &str) -> Self {
        Self {
            id,
            host: host.to_string(),
            port: None,
            rack: None,
        }
    }
}

/// Lists the brokers of a cluster.
#[allow(async_fn_in_trait)]
pub trait Registry {
    /// Returns every broker that could be read, plus one error for each that
    /// couldn't. Brokers without a plaintext host are only returned when
    /// `include_unavailable` is set.
    async fn list_nodes(&mut self, include_unavailable: bool) -> (Vec<Node>, Vec<RegistryError>);
}

#[derive(Deserialize)]
struct BrokerRegistration {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<i32>,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    rack: Option<String>,
}

/// Host and port of a listener such as `SSL://broker-1:9093`.
fn endpoint_address(endpoint: &str) -> Option<(String, Option<u16>)> {
    let address = endpoint.split_once("://").map_or(endpoint, |(_, a)| a);
    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()),
        None => (address, None),
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        None
    } else {
        Some((host.to_string(), port))
    }
}

/// Decodes the JSON a broker writes under `/brokers/ids/<id>`.
pub fn decode_broker(
    id: i32,
    data: &[u8],
    include_unavailable: bool,
) -> Result<Node, RegistryError> {
    let registration: BrokerRegistration =
        serde_json::from_slice(data).map_err(|source| RegistryError::Decode {
            id: id.to_string(),
            source,
        })?;
    let port = registration.port.and_then(|p| u16::try_from(p).ok());

    let (host, port) = match registration.host.filter(|h| !h.is_empty()) {
        Some(host) => (host, port),
        None if include_unavailable => registration
            .endpoints
            .iter()
            .find_map(|e| endpoint_address(e))
            .ok_or(RegistryError::NoHost(id))?,
        None => return Err(RegistryError::NoHost(id)),
    };
    Ok(Node {
        id,
        host,
        port,
        rack: registration.rack,
    })
}

fn normalize_prefix(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        String::new()
    } else {
        format!("/{}", prefix)
    }
}

/// Broker listing backed by the ZooKeeper ensemble Kafka registers in.
pub struct ZkRegistry {
    client: zk::Client,
    prefix: String,
}

impl ZkRegistry {
    /// `prefix` is the path Kafka's metadata lives under, if not the root.
    pub async fn connect(
        connect: &str,
        prefix: &str,
        timeout: Duration,
    ) -> Result<Self, ZkError> {
        Ok(Self {
            client: zk::Client::connect(connect, timeout).await?,
            prefix: normalize_prefix(prefix),
        })
    }

    pub async fn close(self) -> Result<(), ZkError> {
        self.client.close().await
    }
}

impl Registry for ZkRegistry {
    async fn list_nodes(&mut self, include_unavailable: bool) -> (Vec<Node>, Vec<RegistryError>) {
        let ids_path = format!("{}/brokers/ids", self.prefix);
        let children = match self.client.get_children(&ids_path).await {
            Ok(children) => children,
            Err(err) => return (Vec::new(), vec![err.into()]),
        };

        let mut nodes = Vec::with_capacity(children.len());
        let mut errors = Vec::new();
        for child in children {
            let Ok(id) = child.parse::<i32>() else {
                errors.push(RegistryError::InvalidId(child));
                continue;
            };
            let data = match self.client.get_data(&format!("{}/{}", ids_path, child)).await {
                Ok(data) => data,
                Err(err) if err.is_no_node() => {
                    debug!("broker {} deregistered while listing", id);
                    continue;
                }
                Err(err) => {
                    errors.push(err.into());
                    continue;
                }
            };
            match decode_broker(id, &data, include_unavailable) {
                Ok(node) => nodes.push(node),
                Err(err) => errors.push(err),
            }
        }
        nodes.sort_by_key(|n| n.id);
        debug!("listed {} brokers, {} errors", nodes.len(), errors.len());
        (nodes, errors)
    }
}
