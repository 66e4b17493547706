//! HTTP/1.x 会话编解码
//!
//! 只覆盖服务端会话需要的部分：解析带 `Content-Length` 的请求，编码响应。
//! 请求头的语法交给 `httparse`；分块传输编码不被支持，会作为协议错误停止会话。

use std::io;
use std::net::SocketAddr;

use ::http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use ::http::{Method, Request, Response, Uri, Version};
use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::FrameCodec;
use crate::buffer::RecvPayload;
use crate::config::EndpointConfig;
use crate::error::TransportError;

const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADERS: usize = 100;

/// HTTP 编解码错误
#[derive(Debug, thiserror::Error)]
pub enum HttpCodecError {
    #[error("message of {size} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<HttpCodecError> for TransportError {
    fn from(error: HttpCodecError) -> Self {
        match error {
            HttpCodecError::Io(e) => TransportError::from(e),
            other => TransportError::protocol_error("http", other.to_string()),
        }
    }
}

/// 会话可以发送结构化响应，也可以发送原始字节
#[derive(Debug, Clone)]
pub enum HttpOutbound {
    Response(Response<Bytes>),
    Raw(Bytes),
}

impl From<Response<Bytes>> for HttpOutbound {
    fn from(response: Response<Bytes>) -> Self {
        HttpOutbound::Response(response)
    }
}

impl From<Bytes> for HttpOutbound {
    fn from(raw: Bytes) -> Self {
        HttpOutbound::Raw(raw)
    }
}

impl From<&'static str> for HttpOutbound {
    fn from(raw: &'static str) -> Self {
        HttpOutbound::Raw(Bytes::from_static(raw.as_bytes()))
    }
}

/// HTTP 请求解码 / 响应编码
#[derive(Debug)]
pub struct HttpCodec {
    /// 跨接收累积的未解析字节
    pending: BytesMut,
    /// 已经确认不含头部结束符的前缀长度，下次从这里继续查找
    scanned: usize,
    max_message_size: usize,
}

impl HttpCodec {
    pub fn new(init_buffer_size: usize, max_message_size: usize) -> Self {
        Self {
            pending: BytesMut::with_capacity(init_buffer_size),
            scanned: 0,
            max_message_size,
        }
    }

    pub fn from_config(config: &EndpointConfig) -> Self {
        Self::new(config.init_buffer_size, config.max_buffer_size)
    }
}

impl Default for HttpCodec {
    fn default() -> Self {
        Self::from_config(&EndpointConfig::default())
    }
}

impl Decoder for HttpCodec {
    type Item = Request<Bytes>;
    type Error = HttpCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // 结束符可能跨越上次查找的边界
        let resume = self.scanned.min(src.len()).saturating_sub(HEADER_END.len() - 1);
        let Some(header_end) = find(&src[resume..], HEADER_END).map(|offset| resume + offset) else {
            self.scanned = src.len();
            if src.len() > self.max_message_size {
                return Err(HttpCodecError::MessageTooLarge {
                    size: src.len(),
                    max: self.max_message_size,
                });
            }
            return Ok(None);
        };
        self.scanned = header_end;

        let body_start = header_end + HEADER_END.len();
        let head = parse_head(&src[..body_start])?;
        let total_length = body_start + head.content_length;

        if total_length > self.max_message_size {
            return Err(HttpCodecError::MessageTooLarge {
                size: total_length,
                max: self.max_message_size,
            });
        }

        if src.len() < total_length {
            src.reserve(total_length - src.len());
            return Ok(None);
        }

        let message = src.split_to(total_length).freeze();
        let body = message.slice(body_start..);
        self.scanned = 0;

        let mut request = Request::builder()
            .method(head.method)
            .uri(head.uri)
            .version(head.version)
            .body(body)
            .map_err(|e| HttpCodecError::Malformed(e.to_string()))?;
        request.headers_mut().extend(head.headers);

        Ok(Some(request))
    }
}

impl Encoder<HttpOutbound> for HttpCodec {
    type Error = HttpCodecError;

    fn encode(&mut self, item: HttpOutbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            HttpOutbound::Raw(raw) => dst.extend_from_slice(&raw),
            HttpOutbound::Response(response) => encode_response(response, dst),
        }
        Ok(())
    }
}

impl FrameCodec for HttpCodec {
    type In = Request<Bytes>;
    type Out = HttpOutbound;

    fn decode(
        &mut self,
        buf: &RecvPayload,
        _from: Option<SocketAddr>,
        out: &mut Vec<Self::In>,
    ) -> Result<(), TransportError> {
        self.pending.extend_from_slice(buf.as_slice());
        let mut pending = std::mem::take(&mut self.pending);
        let result = loop {
            match Decoder::decode(self, &mut pending) {
                Ok(Some(request)) => out.push(request),
                Ok(None) => break Ok(()),
                Err(e) => break Err(TransportError::from(e)),
            }
        };
        self.pending = pending;
        result
    }

    fn encode(&mut self, item: HttpOutbound, dst: &mut BytesMut) -> Result<Option<SocketAddr>, TransportError> {
        Encoder::encode(self, item, dst)?;
        Ok(None)
    }
}

struct RequestHead {
    method: Method,
    uri: Uri,
    version: Version,
    headers: Vec<(HeaderName, HeaderValue)>,
    content_length: usize,
}

fn parse_head(head: &[u8]) -> Result<RequestHead, HttpCodecError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    match request.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HttpCodecError::Malformed("incomplete request head".into()));
        }
        Err(httparse::Error::TooManyHeaders) => {
            return Err(HttpCodecError::Malformed("too many headers".into()));
        }
        Err(httparse::Error::Version) => {
            return Err(HttpCodecError::Unsupported("http version".into()));
        }
        Err(e) => return Err(HttpCodecError::Malformed(e.to_string())),
    }

    let (Some(method), Some(target), Some(version)) = (request.method, request.path, request.version) else {
        return Err(HttpCodecError::Malformed("missing request line".into()));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| HttpCodecError::Malformed(format!("bad method '{}'", method)))?;
    let uri: Uri = target
        .parse()
        .map_err(|_| HttpCodecError::Malformed(format!("bad request target '{}'", target)))?;
    let version = match version {
        1 => Version::HTTP_11,
        0 => Version::HTTP_10,
        other => return Err(HttpCodecError::Unsupported(format!("version 1.{}", other))),
    };

    let mut headers = Vec::with_capacity(request.headers.len());
    let mut content_length: Option<usize> = None;
    for header in request.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| HttpCodecError::Malformed(format!("bad header name '{}'", header.name)))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| HttpCodecError::Malformed(format!("bad value for header '{}'", name)))?;

        if name == TRANSFER_ENCODING && !trim_ows(value.as_bytes()).eq_ignore_ascii_case(b"identity") {
            return Err(HttpCodecError::Unsupported(format!(
                "transfer-encoding '{}'",
                String::from_utf8_lossy(value.as_bytes())
            )));
        }
        if name == CONTENT_LENGTH {
            let length = parse_content_length(value.as_bytes())
                .ok_or_else(|| HttpCodecError::Malformed("bad content-length".into()))?;
            if content_length.is_some_and(|existing| existing != length) {
                return Err(HttpCodecError::Malformed("conflicting content-length".into()));
            }
            content_length = Some(length);
        }
        headers.push((name, value));
    }

    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
        content_length: content_length.unwrap_or(0),
    })
}

/// `Content-Length = 1*DIGIT`：只接受十进制数字，两侧可以有空白
fn parse_content_length(value: &[u8]) -> Option<usize> {
    let digits = trim_ows(value);
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn trim_ows(value: &[u8]) -> &[u8] {
    let is_ows = |b: &u8| *b == b' ' || *b == b'\t';
    let start = value.iter().position(|b| !is_ows(b)).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !is_ows(b)).map_or(start, |i| i + 1);
    &value[start..end]
}

fn encode_response(response: Response<Bytes>, dst: &mut BytesMut) {
    let (parts, body) = response.into_parts();
    let version = match parts.version {
        Version::HTTP_10 => "HTTP/1.0",
        _ => "HTTP/1.1",
    };

    dst.reserve(128 + body.len());
    dst.put_slice(version.as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(parts.status.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(parts.status.canonical_reason().unwrap_or("").as_bytes());
    dst.put_slice(b"\r\n");

    for (name, value) in parts.headers.iter() {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    if !parts.headers.contains_key(CONTENT_LENGTH) {
        dst.put_slice(b"content-length: ");
        dst.put_slice(body.len().to_string().as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    dst.put_slice(&body);
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
