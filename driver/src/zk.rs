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

//! Just enough of the ZooKeeper client protocol to read broker registrations:
//! session handshake, getChildren, getData and close. Requests are issued one
//! at a time and no watches are ever set.

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Chain, ZkError};

pub const DEFAULT_PORT: u16 = 2181;

const OP_GET_DATA: i32 = 4;
const OP_GET_CHILDREN: i32 = 8;
const OP_CLOSE: i32 = -11;

const XID_WATCH_EVENT: i32 = -1;
const XID_PING: i32 = -2;

const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Splits `host1:2181,host2:2181/chroot` into server addresses and chroot.
pub fn parse_connect_string(connect: &str) -> (Vec<String>, String) {
    let (hosts, chroot) = match connect.find('/') {
        Some(i) => (&connect[..i], connect[i..].trim_end_matches('/')),
        None => (connect, ""),
    };
    let servers = hosts
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(|h| {
            if h.contains(':') {
                h.to_string()
            } else {
                format!("{}:{}", h, DEFAULT_PORT)
            }
        })
        .collect();
    (servers, chroot.to_string())
}

fn frame(body: BytesMut) -> Bytes {
    let mut out = BytesMut::with_capacity(body.len() + 4);
    out.put_i32(body.len() as i32);
    out.extend_from_slice(&body);
    out.freeze()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_i32(s.len() as i32);
    buf.put_slice(s.as_bytes());
}

fn encode_connect(session_timeout: Duration) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(0); // protocol version
    body.put_i64(0); // last zxid seen
    body.put_i32(session_timeout.as_millis().min(i32::MAX as u128) as i32);
    body.put_i64(0); // session id
    body.put_i32(16);
    body.put_slice(&[0u8; 16]);
    body.put_u8(0); // read only
    frame(body)
}

fn encode_request(xid: i32, op: i32, path: Option<&str>) -> Bytes {
    let mut body = BytesMut::new();
    body.put_i32(xid);
    body.put_i32(op);
    if let Some(path) = path {
        put_string(&mut body, path);
        body.put_u8(0); // watch
    }
    frame(body)
}

fn get_i32(buf: &mut &[u8]) -> Result<i32, ZkError> {
    if buf.remaining() < 4 {
        return Err(ZkError::Malformed("truncated int"));
    }
    Ok(buf.get_i32())
}

fn get_i64(buf: &mut &[u8]) -> Result<i64, ZkError> {
    if buf.remaining() < 8 {
        return Err(ZkError::Malformed("truncated long"));
    }
    Ok(buf.get_i64())
}

fn get_buffer(buf: &mut &[u8]) -> Result<Option<Vec<u8>>, ZkError> {
    let len = get_i32(buf)?;
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(ZkError::Malformed("truncated buffer"));
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(Some(data))
}

fn get_string(buf: &mut &[u8]) -> Result<String, ZkError> {
    let data = get_buffer(buf)?.unwrap_or_default();
    String::from_utf8(data).map_err(|_| ZkError::Malformed("string is not UTF-8"))
}

#[derive(Debug, PartialEq)]
struct ConnectResponse {
    timeout_ms: i32,
    session_id: i64,
}

fn decode_connect(mut buf: &[u8]) -> Result<ConnectResponse, ZkError> {
    let _protocol_version = get_i32(&mut buf)?;
    let timeout_ms = get_i32(&mut buf)?;
    let session_id = get_i64(&mut buf)?;
    let _password = get_buffer(&mut buf)?;
    // A zero timeout is how the server refuses the session.
    if timeout_ms <= 0 {
        return Err(ZkError::SessionExpired);
    }
    Ok(ConnectResponse {
        timeout_ms,
        session_id,
    })
}

#[derive(Debug, PartialEq)]
struct ReplyHeader {
    xid: i32,
    zxid: i64,
    err: i32,
}

fn decode_header(buf: &mut &[u8]) -> Result<ReplyHeader, ZkError> {
    Ok(ReplyHeader {
        xid: get_i32(buf)?,
        zxid: get_i64(buf)?,
        err: get_i32(buf)?,
    })
}

fn decode_children(mut buf: &[u8]) -> Result<Vec<String>, ZkError> {
    let count = get_i32(&mut buf)?;
    let mut children = Vec::with_capacity(count.max(0) as usize);
    for _ in 0..count.max(0) {
        children.push(get_string(&mut buf)?);
    }
    Ok(children)
}

/// The znode payload; the trailing stat is ignored.
fn decode_data(mut buf: &[u8]) -> Result<Vec<u8>, ZkError> {
    Ok(get_buffer(&mut buf)?.unwrap_or_default())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, ZkError> {
    let len = stream.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME_LEN {
        return Err(ZkError::Malformed("frame length out of range"));
    }
    let mut buf = vec![0; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

pub struct Client {
    stream: TcpStream,
    chroot: String,
    xid: i32,
    timeout: Duration,
}

impl Client {
    /// Opens a session with the first reachable server of `connect`.
    /// `timeout` is both the requested session timeout and the limit on
    /// every request.
    pub async fn connect(connect: &str, timeout: Duration) -> Result<Self, ZkError> {
        let (servers, chroot) = parse_connect_string(connect);
        for server in servers.iter() {
            match tokio::time::timeout(timeout, Self::handshake(server, timeout)).await {
                Ok(Ok((stream, session))) => {
                    info!(
                        "connected to ZooKeeper at {}, session 0x{:x} ({} ms)",
                        server, session.session_id, session.timeout_ms
                    );
                    return Ok(Self {
                        stream,
                        chroot,
                        xid: 0,
                        timeout,
                    });
                }
                Ok(Err(err)) => warn!(
                    "unable to connect to ZooKeeper at {}: {}",
                    server,
                    Chain(&err)
                ),
                Err(_) => warn!("timed out connecting to ZooKeeper at {}", server),
            }
        }
        Err(ZkError::NoServer(connect.to_string()))
    }

    async fn handshake(
        server: &str,
        timeout: Duration,
    ) -> Result<(TcpStream, ConnectResponse), ZkError> {
        let mut stream = TcpStream::connect(server).await?;
        stream.write_all(&encode_connect(timeout)).await?;
        let response = decode_connect(&read_frame(&mut stream).await?)?;
        Ok((stream, response))
    }

    fn full_path(&self, path: &str) -> String {
        match (self.chroot.as_str(), path) {
            ("", path) => path.to_string(),
            (chroot, "/") => chroot.to_string(),
            (chroot, path) => format!("{}{}", chroot, path),
        }
    }

    async fn exchange(&mut self, op: i32, path: Option<&str>) -> Result<Vec<u8>, ZkError> {
        self.xid += 1;
        let xid = self.xid;
        self.stream.write_all(&encode_request(xid, op, path)).await?;
        loop {
            let frame = read_frame(&mut self.stream).await?;
            let mut buf = frame.as_slice();
            let header = decode_header(&mut buf)?;
            trace!("reply xid {} zxid 0x{:x} err {}", header.xid, header.zxid, header.err);
            match header.xid {
                XID_WATCH_EVENT | XID_PING => continue,
                id if id != xid => return Err(ZkError::Malformed("reply out of order")),
                _ => {}
            }
            if header.err != 0 {
                return Err(ZkError::Server {
                    code: header.err,
                    path: path.unwrap_or_default().to_string(),
                });
            }
            return Ok(buf.to_vec());
        }
    }

    async fn call(&mut self, op: i32, path: Option<&str>) -> Result<Vec<u8>, ZkError> {
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.exchange(op, path)).await {
            Ok(result) => result,
            Err(_) => Err(ZkError::Timeout(timeout)),
        }
    }

    pub async fn get_children(&mut self, path: &str) -> Result<Vec<String>, ZkError> {
        let path = self.full_path(path);
        decode_children(&self.call(OP_GET_CHILDREN, Some(&path)).await?)
    }

    pub async fn get_data(&mut self, path: &str) -> Result<Vec<u8>, ZkError> {
        let path = self.full_path(path);
        decode_data(&self.call(OP_GET_DATA, Some(&path)).await?)
    }

    pub async fn close(mut self) -> Result<(), ZkError> {
        self.call(OP_CLOSE, None).await.map(|_| ())
    }
}
