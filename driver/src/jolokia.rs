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

use std::collections::BTreeMap;
use std::time::Duration;

use hyper::Uri;
use serde::{Deserialize, Serialize};

use crate::collect::AttributeSource;
use crate::error::{CollectError, FetchError};
use crate::fetch;
use crate::registry::Node;

pub const DEFAULT_PORT: u16 = 8778;
pub const DEFAULT_PATH: &str = "/jolokia/";

/// MBean name -> that MBean's attributes, as returned by a pattern read.
pub type AttributeTree = BTreeMap<String, serde_json::Value>;

/// The single numeric attribute of a gauge MBean.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AttributeValue {
    #[serde(rename = "Value")]
    pub value: f64,
}

impl AttributeValue {
    pub fn decode(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        AttributeValue::deserialize(value)
    }
}

#[derive(Serialize)]
struct ReadRequest<'a> {
    r#type: &'static str,
    mbean: &'a str,
}

#[derive(Deserialize)]
struct ReadResponse {
    status: u16,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

fn decode_read(body: &[u8]) -> Result<AttributeTree, CollectError> {
    let response: ReadResponse = serde_json::from_slice(body)?;
    if response.status != 200 {
        return Err(CollectError::Jolokia {
            status: response.status,
            message: response.error.unwrap_or_default(),
        });
    }
    match response.value {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(AttributeTree::new()),
    }
}

/// A client for one Jolokia agent.
pub struct JolokiaClient {
    url: Uri,
    timeout: Duration,
}

impl JolokiaClient {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, FetchError> {
        Ok(Self {
            url: fetch::parse_uri(url)?,
            timeout,
        })
    }

    /// Reads every attribute of the MBeans matching `pattern`.
    pub async fn read_attribute(&self, pattern: &str) -> Result<AttributeTree, CollectError> {
        let request = serde_json::to_vec(&ReadRequest {
            r#type: "read",
            mbean: pattern,
        })?;
        let response = fetch::post_json(&self.url, request, self.timeout)
            .await?
            .error_for_status()?;
        decode_read(&response.body)
    }
}

/// Reaches the Jolokia agent each broker runs on a well-known port.
#[derive(Debug, Clone)]
pub struct Jolokia {
    port: u16,
    timeout: Duration,
}

impl Jolokia {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    pub fn url_for(&self, host: &str) -> String {
        if host.contains(':') && !host.starts_with('[') {
            format!("http://[{}]:{}{}", host, self.port, DEFAULT_PATH)
        } else {
            format!("http://{}:{}{}", host, self.port, DEFAULT_PATH)
        }
    }
}

impl AttributeSource for Jolokia {
    async fn read_attribute(
        &self,
        node: &Node,
        pattern: &str,
    ) -> Result<AttributeTree, CollectError> {
        let client = JolokiaClient::new(&self.url_for(&node.host), self.timeout)?;
        client.read_attribute(pattern).await
    }
}
