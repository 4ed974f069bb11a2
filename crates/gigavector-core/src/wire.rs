//! Binary wire protocol: big-endian frame codec for the eleven message
//! types in spec.md §4.13/§6.

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};

/// Frame header size: 4B length + 1B msg_type + 4B request_id.
const HEADER_LEN: usize = 9;

/// Message type codes (spec.md §4.13).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Add,
    Search,
    Delete,
    Update,
    Get,
    BatchAdd,
    BatchSearch,
    Stats,
    Health,
    Save,
    Response,
}

impl MessageType {
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Add => 1,
            Self::Search => 2,
            Self::Delete => 3,
            Self::Update => 4,
            Self::Get => 5,
            Self::BatchAdd => 6,
            Self::BatchSearch => 7,
            Self::Stats => 8,
            Self::Health => 9,
            Self::Save => 10,
            Self::Response => 128,
        }
    }

    /// # Errors
    ///
    /// `Protocol` if `code` doesn't match a known message type.
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => Self::Add,
            2 => Self::Search,
            3 => Self::Delete,
            4 => Self::Update,
            5 => Self::Get,
            6 => Self::BatchAdd,
            7 => Self::BatchSearch,
            8 => Self::Stats,
            9 => Self::Health,
            10 => Self::Save,
            128 => Self::Response,
            other => return Err(Error::Protocol(format!("unknown message type {other}"))),
        })
    }
}

/// A decoded frame: message type, correlation id, and raw payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: MessageType,
    pub request_id: u32,
    pub payload: Vec<u8>,
}

/// Encodes `payload` under `msg_type`/`request_id` into a length-prefixed
/// frame: `[4B length | 1B msg_type | 4B request_id | payload]`, big-endian,
/// `length = 5 + len(payload)`.
#[must_use]
pub fn encode_frame(msg_type: MessageType, request_id: u32, payload: &[u8]) -> Vec<u8> {
    let length = 5 + payload.len() as u32;
    let mut out = Vec::with_capacity(4 + length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.push(msg_type.code());
    out.extend_from_slice(&request_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Decodes a single frame from `buf`, which must contain at least the
/// 4-byte length prefix plus `length` bytes.
///
/// # Errors
///
/// `Protocol` if `buf` is shorter than the declared frame length, the
/// header is shorter than 5 bytes, or the message type is unknown.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize)> {
    if buf.len() < 4 {
        return Err(Error::Protocol("frame shorter than length prefix".into()));
    }
    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if length < 5 {
        return Err(Error::Protocol(format!("frame length {length} < 5")));
    }
    if buf.len() < 4 + length {
        return Err(Error::Protocol("truncated frame".into()));
    }
    let msg_type = MessageType::from_code(buf[4])?;
    let request_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]);
    let payload = buf[HEADER_LEN..4 + length].to_vec();
    Ok((Frame { msg_type, request_id, payload }, 4 + length))
}

/// Sequential big-endian cursor over a byte slice.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Protocol("payload truncated".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len checked")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().expect("len checked")))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take(4)?.try_into().expect("len checked")))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn vector(&mut self, dim: usize) -> Result<Vec<f32>> {
        (0..dim).map(|_| self.f32()).collect()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_bits().to_be_bytes());
}

fn push_vector(out: &mut Vec<u8>, v: &[f32]) {
    for &x in v {
        push_f32(out, x);
    }
}

/// `ADD` request payload: `dim | dim*f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct AddRequest {
    pub data: Vec<f32>,
}

impl AddRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.data.len() as u32);
        push_vector(&mut out, &self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let dim = r.u32()? as usize;
        let data = r.vector(dim)?;
        Ok(Self { data })
    }
}

/// `SEARCH` request payload: `dim | k | metric | dim*f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub k: u32,
    pub metric: DistanceMetric,
    pub data: Vec<f32>,
}

impl SearchRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.data.len() as u32);
        push_u32(&mut out, self.k);
        out.push(self.metric.wire_code());
        push_vector(&mut out, &self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let dim = r.u32()? as usize;
        let k = r.u32()?;
        let metric = DistanceMetric::from_wire_code(r.u8()?)?;
        let data = r.vector(dim)?;
        Ok(Self { k, metric, data })
    }
}

/// `DELETE` request payload: `id`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeleteRequest {
    pub id: u64,
}

impl DeleteRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u64(&mut out, self.id);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { id: r.u64()? })
    }
}

/// `UPDATE` request payload: `id | dim | dim*f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub id: u64,
    pub data: Vec<f32>,
}

impl UpdateRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u64(&mut out, self.id);
        push_u32(&mut out, self.data.len() as u32);
        push_vector(&mut out, &self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let id = r.u64()?;
        let dim = r.u32()? as usize;
        let data = r.vector(dim)?;
        Ok(Self { id, data })
    }
}

/// `GET` request payload: `id`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GetRequest {
    pub id: u64,
}

impl GetRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u64(&mut out, self.id);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { id: r.u64()? })
    }
}

/// `BATCH_ADD` request payload: `N | dim | N*dim*f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAddRequest {
    pub vectors: Vec<Vec<f32>>,
}

impl BatchAddRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let dim = self.vectors.first().map_or(0, Vec::len);
        let mut out = Vec::new();
        push_u32(&mut out, self.vectors.len() as u32);
        push_u32(&mut out, dim as u32);
        for v in &self.vectors {
            push_vector(&mut out, v);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let n = r.u32()? as usize;
        let dim = r.u32()? as usize;
        let vectors = (0..n).map(|_| r.vector(dim)).collect::<Result<Vec<_>>>()?;
        Ok(Self { vectors })
    }
}

/// `BATCH_SEARCH` request payload: `Q | dim | k | metric | Q*dim*f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSearchRequest {
    pub k: u32,
    pub metric: DistanceMetric,
    pub queries: Vec<Vec<f32>>,
}

impl BatchSearchRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let dim = self.queries.first().map_or(0, Vec::len);
        let mut out = Vec::new();
        push_u32(&mut out, self.queries.len() as u32);
        push_u32(&mut out, dim as u32);
        push_u32(&mut out, self.k);
        out.push(self.metric.wire_code());
        for q in &self.queries {
            push_vector(&mut out, q);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let q = r.u32()? as usize;
        let dim = r.u32()? as usize;
        let k = r.u32()?;
        let metric = DistanceMetric::from_wire_code(r.u8()?)?;
        let queries = (0..q).map(|_| r.vector(dim)).collect::<Result<Vec<_>>>()?;
        Ok(Self { k, metric, queries })
    }
}

/// `SAVE` request payload: optional filepath bytes (empty payload means
/// "use the component's default path").
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SaveRequest {
    pub path: Option<String>,
}

impl SaveRequest {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.path.as_ref().map_or_else(Vec::new, |p| p.as_bytes().to_vec())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Ok(Self { path: None });
        }
        let path = String::from_utf8(payload.to_vec())
            .map_err(|e| Error::Protocol(format!("SAVE path is not valid utf-8: {e}")))?;
        Ok(Self { path: Some(path) })
    }
}

/// Generic `i32 status` response, used by ADD/DELETE/UPDATE/BATCH_ADD/SAVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub status: i32,
}

impl StatusResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self { status: 0 }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_i32(&mut out, self.status);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { status: r.i32()? })
    }
}

/// `SEARCH` response payload: `n | (id, dist)*n`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchResponse {
    pub hits: Vec<(u64, f32)>,
}

impl SearchResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.hits.len() as u32);
        for &(id, dist) in &self.hits {
            push_u64(&mut out, id);
            push_f32(&mut out, dist);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let n = r.u32()? as usize;
        let mut hits = Vec::with_capacity(n);
        for _ in 0..n {
            hits.push((r.u64()?, r.f32()?));
        }
        Ok(Self { hits })
    }
}

/// `GET` response payload: `dim | dim*f32` on success.
#[derive(Debug, Clone, PartialEq)]
pub struct GetResponse {
    pub data: Vec<f32>,
}

impl GetResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.data.len() as u32);
        push_vector(&mut out, &self.data);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let dim = r.u32()? as usize;
        Ok(Self { data: r.vector(dim)? })
    }
}

/// `BATCH_SEARCH` response payload: `Q | (k | (id, dist)*k)*Q`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchSearchResponse {
    pub results: Vec<Vec<(u64, f32)>>,
}

impl BatchSearchResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u32(&mut out, self.results.len() as u32);
        for hits in &self.results {
            push_u32(&mut out, hits.len() as u32);
            for &(id, dist) in hits {
                push_u64(&mut out, id);
                push_f32(&mut out, dist);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let q = r.u32()? as usize;
        let mut results = Vec::with_capacity(q);
        for _ in 0..q {
            let k = r.u32()? as usize;
            let mut hits = Vec::with_capacity(k);
            for _ in 0..k {
                hits.push((r.u64()?, r.f32()?));
            }
            results.push(hits);
        }
        Ok(Self { results })
    }
}

/// `STATS` response payload: four big-endian `u64` counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsResponse {
    pub total_requests: u64,
    pub active_connections: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl StatsResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_u64(&mut out, self.total_requests);
        push_u64(&mut out, self.active_connections);
        push_u64(&mut out, self.bytes_sent);
        push_u64(&mut out, self.bytes_received);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self {
            total_requests: r.u64()?,
            active_connections: r.u64()?,
            bytes_sent: r.u64()?,
            bytes_received: r.u64()?,
        })
    }
}

/// `HEALTH` response payload: `i32 health` (0 = healthy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthResponse {
    pub health: i32,
}

impl HealthResponse {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_i32(&mut out, self.health);
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        Ok(Self { health: r.i32()? })
    }
}

/// `RESPONSE` (msg_type=128) error payload: `err_code | utf-8 message`.
/// `err_code = 0` is reserved for success and is never encoded by this
/// type — use [`StatusResponse`]/[`SearchResponse`]/etc. for success
/// payloads instead.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorResponse {
    pub err_code: i32,
    pub message: String,
}

impl ErrorResponse {
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        Self {
            err_code: err.wire_code(),
            message: err.to_string(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        push_i32(&mut out, self.err_code);
        out.extend_from_slice(self.message.as_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut r = Reader::new(payload);
        let err_code = r.i32()?;
        let remaining = r.remaining();
        let message_bytes = r.take(remaining)?.to_vec();
        let message = String::from_utf8(message_bytes)
            .map_err(|e| Error::Protocol(format!("error message is not valid utf-8: {e}")))?;
        Ok(Self { err_code, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips() {
        let payload = vec![1, 2, 3, 4];
        let bytes = encode_frame(MessageType::Add, 42, &payload);
        let (frame, consumed) = decode_frame(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.msg_type, MessageType::Add);
        assert_eq!(frame.request_id, 42);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn truncated_frame_is_protocol_error() {
        let bytes = encode_frame(MessageType::Add, 1, &[1, 2, 3]);
        assert!(matches!(decode_frame(&bytes[..6]), Err(Error::Protocol(_))));
    }

    #[test]
    fn length_below_minimum_is_protocol_error() {
        let mut bytes = Vec::new();
        push_u32(&mut bytes, 4);
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        assert!(matches!(decode_frame(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn unknown_message_type_is_protocol_error() {
        let bytes = encode_frame(MessageType::Add, 1, &[]);
        let mut bad = bytes.clone();
        bad[4] = 99;
        assert!(matches!(decode_frame(&bad), Err(Error::Protocol(_))));
    }

    #[test]
    fn add_request_round_trips() {
        let req = AddRequest { data: vec![1.0, 2.0, 3.0] };
        let decoded = AddRequest::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn search_request_round_trips() {
        let req = SearchRequest { k: 5, metric: DistanceMetric::Cosine, data: vec![1.0, 0.0] };
        let decoded = SearchRequest::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn batch_search_round_trips() {
        let req = BatchSearchRequest {
            k: 3,
            metric: DistanceMetric::Euclidean,
            queries: vec![vec![1.0, 2.0], vec![3.0, 4.0]],
        };
        let decoded = BatchSearchRequest::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn search_response_round_trips() {
        let resp = SearchResponse { hits: vec![(1, 0.5), (2, 1.5)] };
        let decoded = SearchResponse::decode(&resp.encode()).unwrap();
        assert_eq!(resp, decoded);
    }

    #[test]
    fn save_request_with_no_path_round_trips_to_none() {
        let req = SaveRequest::default();
        let decoded = SaveRequest::decode(&req.encode()).unwrap();
        assert_eq!(decoded.path, None);
    }

    #[test]
    fn save_request_with_path_round_trips() {
        let req = SaveRequest { path: Some("/tmp/snapshot.gv".to_string()) };
        let decoded = SaveRequest::decode(&req.encode()).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn error_response_round_trips() {
        let err = Error::NotFound(7);
        let resp = ErrorResponse::from_error(&err);
        let decoded = ErrorResponse::decode(&resp.encode()).unwrap();
        assert_eq!(resp, decoded);
        assert_eq!(decoded.err_code, 3);
    }
}
