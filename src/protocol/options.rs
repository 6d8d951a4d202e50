//! Per-driver connection options (§6 "Device connection URLs").
//!
//! `connectionUrl` is `scheme://host:port[?opt=val(&opt=val)*]`; query
//! options are URL-decoded and coerced to bool/int where the option calls
//! for it. Grounded on the teacher's `network/discovery.rs`, which parses
//! a similar `scheme://host:port` peer-address shape with the `url` crate;
//! generalized here to also decode the query string.

use std::collections::HashMap;

use url::Url;

use crate::error::{Error, Result};

/// The connection scheme, parsed from the URL authority (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    TcpClient,
    TcpServer,
    UdpClient,
    UdpServer,
    HttpClient,
    HttpServer,
    ModbusClient,
    ModbusServer,
    SecsGemClient,
    SecsGemServer,
    Dummy,
}

impl Scheme {
    fn parse(raw: &str) -> Result<Self> {
        Ok(match raw {
            "tcp-client" => Scheme::TcpClient,
            "tcp-server" => Scheme::TcpServer,
            "udp-client" => Scheme::UdpClient,
            "udp-server" => Scheme::UdpServer,
            "http-client" => Scheme::HttpClient,
            "http-server" => Scheme::HttpServer,
            "modbus-client" => Scheme::ModbusClient,
            "modbus-server" => Scheme::ModbusServer,
            "secsgem-client" => Scheme::SecsGemClient,
            "secsgem-server" => Scheme::SecsGemServer,
            "dummy" => Scheme::Dummy,
            other => return Err(Error::UnknownScheme(other.to_string())),
        })
    }
}

/// Fully decoded connection options for one device (§6 common options).
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,

    pub start_bytes: Option<Vec<u8>>,
    pub end_bytes: Option<Vec<u8>>,
    pub retain_start_end_bytes: bool,
    pub buffer_time_ms: u64,
    pub combine_buffered_data: bool,
    pub connection_lost_on_exception: bool,

    /// HTTP only.
    pub use_byte_array_body: bool,
    /// mTLS, base64-encoded in the query string.
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub trust_cert: Option<Vec<u8>>,
    /// UDP server only.
    pub multicast_group: Option<String>,
    /// Modbus only.
    pub unit_id: Option<u8>,
    pub combine_data: bool,
}

impl ConnectionOptions {
    pub fn parse(connection_url: &str) -> Result<Self> {
        let url = Url::parse(connection_url)
            .map_err(|e| Error::Validation(format!("invalid connection url {connection_url:?}: {e}")))?;

        let scheme = Scheme::parse(url.scheme())?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Validation(format!("connection url missing host: {connection_url:?}")))?
            .to_string();
        let port = url
            .port()
            .ok_or_else(|| Error::Validation(format!("connection url missing port: {connection_url:?}")))?;

        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();

        Ok(Self {
            scheme,
            host,
            port,
            start_bytes: decode_bytes_opt(&query, "startBytes")?,
            end_bytes: decode_bytes_opt(&query, "endBytes")?,
            retain_start_end_bytes: parse_bool(&query, "retainStartEndBytes", false)?,
            buffer_time_ms: parse_u64(&query, "bufferTime", 0)?,
            combine_buffered_data: parse_bool(&query, "combineBufferedData", false)?,
            connection_lost_on_exception: parse_bool(&query, "connectionLostOnException", false)?,
            use_byte_array_body: parse_bool(&query, "useByteArrayBody", false)?,
            cert: decode_base64_opt(&query, "cert")?,
            key: decode_base64_opt(&query, "key")?,
            trust_cert: decode_base64_opt(&query, "trustCert")?,
            multicast_group: query.get("multicastGroup").cloned(),
            unit_id: match query.get("unitId") {
                Some(v) => Some(
                    v.parse()
                        .map_err(|_| Error::Validation(format!("unitId must be a byte: {v:?}")))?,
                ),
                None => None,
            },
            combine_data: parse_bool(&query, "combineData", false)?,
        })
    }
}

fn parse_bool(query: &HashMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match query.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Validation(format!("{key} must be a bool, got {v:?}"))),
    }
}

fn parse_u64(query: &HashMap<String, String>, key: &str, default: u64) -> Result<u64> {
    match query.get(key) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::Validation(format!("{key} must be an integer, got {v:?}"))),
    }
}

/// `startBytes`/`endBytes` are given as their literal text; escape
/// sequences like `\r\n` are honored the way a shell would interpret them,
/// since these values name raw delimiter bytes, not arbitrary UTF-8.
fn decode_bytes_opt(query: &HashMap<String, String>, key: &str) -> Result<Option<Vec<u8>>> {
    match query.get(key) {
        None => Ok(None),
        Some(v) => Ok(Some(unescape(v))),
    }
}

fn unescape(raw: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('r') => out.push(b'\r'),
                Some('n') => out.push(b'\n'),
                Some('t') => out.push(b'\t'),
                Some('\\') => out.push(b'\\'),
                Some(other) => {
                    out.push(b'\\');
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                }
                None => out.push(b'\\'),
            }
        } else {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    out
}

fn decode_base64_opt(query: &HashMap<String, String>, key: &str) -> Result<Option<Vec<u8>>> {
    use base64::Engine;
    match query.get(key) {
        None => Ok(None),
        Some(v) => base64::engine::general_purpose::STANDARD
            .decode(v)
            .map(Some)
            .map_err(|e| Error::Validation(format!("{key} is not valid base64: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_tcp_client() {
        let opts = ConnectionOptions::parse("tcp-client://127.0.0.1:9999").unwrap();
        assert_eq!(opts.scheme, Scheme::TcpClient);
        assert_eq!(opts.host, "127.0.0.1");
        assert_eq!(opts.port, 9999);
        assert!(opts.end_bytes.is_none());
    }

    #[test]
    fn test_parse_end_bytes_and_buffer_time() {
        let opts = ConnectionOptions::parse(
            "tcp-client://127.0.0.1:9999?endBytes=%5Cr%5Cn&retainStartEndBytes=false&bufferTime=250",
        )
        .unwrap();
        assert_eq!(opts.end_bytes, Some(b"\r\n".to_vec()));
        assert!(!opts.retain_start_end_bytes);
        assert_eq!(opts.buffer_time_ms, 250);
    }

    #[test]
    fn test_unknown_scheme_rejected() {
        assert!(ConnectionOptions::parse("ftp://host:21").is_err());
    }

    #[test]
    fn test_base64_cert_option_decodes() {
        let opts = ConnectionOptions::parse("http-server://0.0.0.0:8443?cert=aGVsbG8%3D").unwrap();
        assert_eq!(opts.cert, Some(b"hello".to_vec()));
    }
}
