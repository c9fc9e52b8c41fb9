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

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Displays an error followed by each of its causes, `outer: inner: root`.
pub struct Chain<'a>(pub &'a dyn StdError);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(cause) = source {
            write!(f, ": {}", cause)?;
            source = cause.source();
        }
        Ok(())
    }
}

/// Failures of a single HTTP exchange.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid URI {0:?}")]
    InvalidUri(String),

    #[error("unsupported URI scheme {0:?}")]
    UnsupportedScheme(String),

    #[error("connection failed")]
    Connect(#[from] std::io::Error),

    #[error("TLS configuration error")]
    Tls(#[from] rustls::Error),

    #[error("invalid TLS server name {0:?}")]
    ServerName(String),

    #[error("HTTP error")]
    Http(#[from] hyper::Error),

    #[error("invalid request")]
    Request(#[from] hyper::http::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned {status}: {body}")]
    Status {
        status: hyper::StatusCode,
        body: String,
    },
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Failures talking to the ZooKeeper ensemble.
#[derive(Error, Debug)]
pub enum ZkError {
    #[error("ZooKeeper I/O error")]
    Io(#[from] std::io::Error),

    #[error("no reachable ZooKeeper server in {0:?}")]
    NoServer(String),

    #[error("ZooKeeper session was not established")]
    SessionExpired,

    #[error("malformed ZooKeeper frame: {0}")]
    Malformed(&'static str),

    #[error("ZooKeeper error {code} on {path}")]
    Server { code: i32, path: String },

    #[error("ZooKeeper request timed out after {0:?}")]
    Timeout(Duration),
}

impl ZkError {
    pub const NO_NODE: i32 = -101;

    pub fn is_no_node(&self) -> bool {
        matches!(self, ZkError::Server { code, .. } if *code == Self::NO_NODE)
    }
}

/// An attribute name that lacks a topic, a partition, or both.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("attribute {name:?} is missing {}", missing_fields(.topic_missing, .partition_missing))]
pub struct ExtractError {
    pub name: String,
    pub topic_missing: bool,
    pub partition_missing: bool,
}

fn missing_fields(topic: &bool, partition: &bool) -> &'static str {
    match (*topic, *partition) {
        (true, true) => "topic and partition",
        (true, false) => "topic",
        _ => "partition",
    }
}

/// Failures surfaced by the collaborators a collector talks to.
#[derive(Error, Debug)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unexpected response shape")]
    Decode(#[from] serde_json::Error),

    #[error("jolokia returned status {status}: {message}")]
    Jolokia { status: u16, message: String },

    #[error("metrics backend error: {0}")]
    Backend(String),

    #[error("no data for node {node}")]
    NoData { node: i32 },

    #[error("query window of {0:?} reaches before the epoch")]
    Window(Duration),

    #[error(transparent)]
    Extract(#[from] ExtractError),
}

/// Failures while listing a single broker.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error(transparent)]
    Zk(#[from] ZkError),

    #[error("broker {id}: invalid registration")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("broker {0}: invalid id")]
    InvalidId(String),

    #[error("broker {0}: no plaintext host registered")]
    NoHost(i32),
}

/// Failures that end a run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("invalid API or app key")]
    InvalidCredentials,

    #[error("unable to validate API credentials")]
    Validate(#[source] CollectError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unable to reach ZooKeeper")]
    Registry(#[from] ZkError),

    #[error("no brokers could be listed")]
    NoNodes(Vec<RegistryError>),

    #[error("broker free space collection failed")]
    Freespace(#[source] CollectError),

    #[error("unable to write results")]
    Export(#[from] std::io::Error),
}
