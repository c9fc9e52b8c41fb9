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

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::http::uri::Authority;
use hyper::{header, Method, Request, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::error::{FetchError, FetchResult};

/// Longest response body excerpt carried in a status error.
const BODY_EXCERPT: usize = 256;

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub body: Bytes,
}

impl Response {
    /// Turns any non-2xx status into `FetchError::Status`.
    pub fn error_for_status(self) -> FetchResult<Self> {
        if self.status.is_success() {
            return Ok(self);
        }
        let mut body = String::from_utf8_lossy(&self.body).into_owned();
        if body.len() > BODY_EXCERPT {
            let mut end = BODY_EXCERPT;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(FetchError::Status {
            status: self.status,
            body,
        })
    }
}

pub fn parse_uri(uri: &str) -> FetchResult<Uri> {
    uri.parse::<Uri>()
        .map_err(|_| FetchError::InvalidUri(uri.to_string()))
}

fn tls_connector() -> FetchResult<TlsConnector> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_root_certificates(roots)
    .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

async fn send<S>(io: S, req: Request<Full<Bytes>>) -> FetchResult<Response>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            error!("connection failed: {:?}", err);
        }
    });

    let res = sender.send_request(req).await?;
    let status = res.status();
    debug!("response: {}", status);
    let body = res.collect().await?.to_bytes();
    Ok(Response { status, body })
}

/// The host to dial. IPv6 literals keep their brackets in a URI but not in a
/// socket address or TLS server name.
fn dial_host(authority: &Authority) -> &str {
    let host = authority.host();
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

async fn exchange(uri: &Uri, req: Request<Full<Bytes>>) -> FetchResult<Response> {
    let authority = uri
        .authority()
        .ok_or_else(|| FetchError::InvalidUri(uri.to_string()))?;
    let host = dial_host(authority);

    match uri.scheme_str().unwrap_or("http") {
        "http" => {
            let port = authority.port_u16().unwrap_or(80);
            let stream = TcpStream::connect((host, port)).await?;
            send(stream, req).await
        }
        "https" => {
            let port = authority.port_u16().unwrap_or(443);
            let name = ServerName::try_from(host.to_string())
                .map_err(|_| FetchError::ServerName(host.to_string()))?;
            let stream = TcpStream::connect((host, port)).await?;
            let stream = tls_connector()?.connect(name, stream).await?;
            send(stream, req).await
        }
        scheme => Err(FetchError::UnsupportedScheme(scheme.to_string())),
    }
}

/// Performs a single request on a fresh connection. The whole exchange,
/// connect through the last body byte, is bounded by `timeout`.
pub async fn fetch(
    method: Method,
    uri: &Uri,
    headers: &[(&str, &str)],
    body: Bytes,
    timeout: Duration,
) -> FetchResult<Response> {
    debug!("starting {} {}", method, uri);
    let authority = uri
        .authority()
        .ok_or_else(|| FetchError::InvalidUri(uri.to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, authority.as_str());
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let req = builder.body(Full::new(body))?;

    match tokio::time::timeout(timeout, exchange(uri, req)).await {
        Ok(result) => result,
        Err(_) => Err(FetchError::Timeout(timeout)),
    }
}

pub async fn get(uri: &Uri, headers: &[(&str, &str)], timeout: Duration) -> FetchResult<Response> {
    fetch(Method::GET, uri, headers, Bytes::new(), timeout).await
}

pub async fn post_json(uri: &Uri, body: Vec<u8>, timeout: Duration) -> FetchResult<Response> {
    fetch(
        Method::POST,
        uri,
        &[("content-type", "application/json")],
        Bytes::from(body),
        timeout,
    )
    .await
}


#[cfg(test)]
mod tests {
    use super::*;
    use hyper::StatusCode;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn get_returns_status_and_body() {
        let addr = testing::serve(|req| {
            assert_eq!(req.method, Method::GET);
            assert_eq!(req.headers.get("x-probe").unwrap(), "1");
            (StatusCode::OK, format!("path={}", req.path))
        })
        .await;

        let uri = parse_uri(&format!("http://{}/a/b?c=d", addr)).unwrap();
        let res = get(&uri, &[("x-probe", "1")], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(&res.body[..], b"path=/a/b?c=d");
    }

    #[tokio::test]
    async fn post_json_sends_body() {
        let addr = testing::serve(|req| {
            assert_eq!(req.method, Method::POST);
            assert_eq!(
                req.headers.get("content-type").unwrap(),
                "application/json"
            );
            (StatusCode::OK, String::from_utf8(req.body.to_vec()).unwrap())
        })
        .await;

        let uri = parse_uri(&format!("http://{}/", addr)).unwrap();
        let res = post_json(&uri, br#"{"a":1}"#.to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(&res.body[..], br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn error_for_status_keeps_body_excerpt() {
        let addr =
            testing::serve(|_| (StatusCode::FORBIDDEN, "x".repeat(1000))).await;
        let uri = parse_uri(&format!("http://{}/", addr)).unwrap();
        let res = get(&uri, &[], Duration::from_secs(5)).await.unwrap();
        match res.error_for_status() {
            Err(FetchError::Status { status, body }) => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body.len(), BODY_EXCERPT);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let uri = parse_uri(&format!("http://{}/", addr)).unwrap();
        let err = get(&uri, &[], Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)));
    }

    #[test]
    fn ipv6_hosts_are_dialed_without_brackets() {
        let uri = parse_uri("http://[::1]:8778/jolokia/").unwrap();
        let authority = uri.authority().unwrap();
        assert_eq!(dial_host(authority), "::1");
        assert_eq!(authority.port_u16(), Some(8778));
        assert!(matches!(
            ServerName::try_from(dial_host(authority).to_string()),
            Ok(ServerName::IpAddress(_))
        ));

        let uri = parse_uri("https://api.datadoghq.com/api/v1/validate").unwrap();
        assert_eq!(dial_host(uri.authority().unwrap()), "api.datadoghq.com");
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let uri = parse_uri("ftp://example.com/").unwrap();
        let err = get(&uri, &[], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedScheme(s) if s == "ftp"));
    }
}
