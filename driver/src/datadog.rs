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

use hyper::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::collect::MetricsBackend;
use crate::error::{CollectError, FetchError};
use crate::fetch;

pub const DEFAULT_API_URL: &str = "https://api.datadoghq.com";

/// One timeseries from a query. Points are `(timestamp millis, value)`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Series {
    #[serde(default)]
    pub metric: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub pointlist: Vec<(f64, Option<f64>)>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    series: Vec<Series>,
}

#[derive(Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    valid: bool,
}

pub struct DatadogClient {
    api_url: Url,
    api_key: String,
    app_key: String,
    timeout: Duration,
}

impl DatadogClient {
    pub fn new(
        api_url: &str,
        api_key: &str,
        app_key: &str,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let api_url =
            Url::parse(api_url).map_err(|_| FetchError::InvalidUri(api_url.to_string()))?;
        Ok(Self {
            api_url,
            api_key: api_key.to_string(),
            app_key: app_key.to_string(),
            timeout,
        })
    }

    fn endpoint(&self, path: &str, params: &[(&str, &str)]) -> Result<hyper::Uri, FetchError> {
        let mut url = self.api_url.clone();
        url.set_path(path);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }
        fetch::parse_uri(url.as_str())
    }
}

impl MetricsBackend for DatadogClient {
    async fn validate_credentials(&self) -> Result<bool, CollectError> {
        let uri = self.endpoint("/api/v1/validate", &[])?;
        let headers = [("dd-api-key", self.api_key.as_str())];
        let response = fetch::get(&uri, &headers, self.timeout).await?;
        if response.status == StatusCode::FORBIDDEN {
            return Ok(false);
        }
        let response = response.error_for_status()?;
        let validation: ValidateResponse = serde_json::from_slice(&response.body)?;
        Ok(validation.valid)
    }

    async fn query_range(
        &self,
        start: i64,
        end: i64,
        query: &str,
    ) -> Result<Vec<Series>, CollectError> {
        let (from, to) = (start.to_string(), end.to_string());
        let uri = self.endpoint(
            "/api/v1/query",
            &[("from", from.as_str()), ("to", to.as_str()), ("query", query)],
        )?;
        let headers = [
            ("dd-api-key", self.api_key.as_str()),
            ("dd-application-key", self.app_key.as_str()),
        ];
        let response = fetch::get(&uri, &headers, self.timeout)
            .await?
            .error_for_status()?;
        let result: QueryResponse = serde_json::from_slice(&response.body)?;
        if result.status == "error" {
            return Err(CollectError::Backend(
                result.error.unwrap_or_else(|| "query failed".to_string()),
            ));
        }
        Ok(result.series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::testing;
    use serde_json::json;

    fn client(addr: std::net::SocketAddr) -> DatadogClient {
        DatadogClient::new(
            &format!("http://{}", addr),
            "api",
            "app",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn validates_credentials() {
        let addr = testing::serve(|req| {
            assert_eq!(req.path, "/api/v1/validate");
            match req.headers.get("dd-api-key").map(|v| v.to_str().unwrap()) {
                Some("api") => (StatusCode::OK, json!({"valid": true}).to_string()),
                _ => (StatusCode::FORBIDDEN, json!({"errors": ["Forbidden"]}).to_string()),
            }
        })
        .await;

        assert!(client(addr).validate_credentials().await.unwrap());

        let bad = DatadogClient::new(
            &format!("http://{}", addr),
            "nope",
            "app",
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!bad.validate_credentials().await.unwrap());
    }

    #[tokio::test]
    async fn queries_range() {
        let addr = testing::serve(|req| {
            let url = Url::parse(&format!("http://localhost{}", req.path)).unwrap();
            assert_eq!(url.path(), "/api/v1/query");
            let params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
            assert_eq!(
                params,
                vec![
                    ("from".to_string(), "100".to_string()),
                    ("to".to_string(), "160".to_string()),
                    ("query".to_string(), "sum:system.disk.free{host:h1}".to_string()),
                ]
            );
            assert_eq!(req.headers.get("dd-application-key").unwrap(), "app");
            let body = json!({
                "status": "ok",
                "series": [{
                    "metric": "system.disk.free",
                    "scope": "host:h1",
                    "pointlist": [[100000.0, 5000000000.0], [160000.0, null]]
                }]
            });
            (StatusCode::OK, body.to_string())
        })
        .await;

        let series = client(addr)
            .query_range(100, 160, "sum:system.disk.free{host:h1}")
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].scope, "host:h1");
        assert_eq!(
            series[0].pointlist,
            vec![(100000.0, Some(5000000000.0)), (160000.0, None)]
        );
    }

    #[tokio::test]
    async fn query_error_is_reported() {
        let addr = testing::serve(|_| {
            let body = json!({"status": "error", "error": "bad query"});
            (StatusCode::OK, body.to_string())
        })
        .await;

        match client(addr).query_range(0, 60, "bogus").await {
            Err(CollectError::Backend(message)) => assert_eq!(message, "bad query"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
