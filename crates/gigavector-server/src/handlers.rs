//! Per-connection request loop: reads one framed message at a time,
//! dispatches it to the shared [`Engine`], and writes back a framed
//! response, in request order (spec.md §5: "within a single connection,
//! responses are emitted in the order requests are received").

use crate::engine::Engine;
use gigavector_core::wire::{
    self, AddRequest, BatchAddRequest, BatchSearchRequest, BatchSearchResponse, DeleteRequest,
    ErrorResponse, GetRequest, GetResponse, HealthResponse, MessageType, SaveRequest,
    SearchRequest, SearchResponse, StatsResponse, StatusResponse, UpdateRequest,
};
use gigavector_core::{Error, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::Ordering;

/// Runs the sequential request/response loop for one connection until the
/// peer closes it or a framing error occurs.
///
/// # Errors
///
/// Returns the `io::Error`/framing `Error` that ended the loop; a clean
/// peer disconnect (EOF on the length prefix) is not an error and returns
/// `Ok(())`.
pub fn handle_connection(stream: &TcpStream, engine: &Engine) -> Result<()> {
    let mut reader = stream;
    let mut writer = stream;

    loop {
        let (frame, bytes_received) = match read_frame(&mut reader, engine.max_message_bytes()) {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(err) => {
                engine.stats.errors.fetch_add(1, Ordering::Relaxed);
                return Err(err);
            }
        };
        engine.stats.bytes_received.fetch_add(bytes_received as u64, Ordering::Relaxed);

        engine.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        let request_id = frame.request_id;
        let (msg_type, payload, close_after) = dispatch(engine, frame);
        if close_after.is_some() {
            engine.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
        let out = wire::encode_frame(msg_type, request_id, &payload);
        engine.stats.bytes_sent.fetch_add(out.len() as u64, Ordering::Relaxed);
        writer.write_all(&out)?;

        // spec.md §7: "the server translates errors into protocol error
        // responses and closes the connection only for Protocol/Internal
        // errors". The response above is still sent so the client sees the
        // failure before the socket goes away.
        if let Some(err) = close_after {
            return Err(err);
        }
    }
}

/// Reads one framed message, rejecting anything whose declared length
/// exceeds `max_message_bytes` (spec.md §4.13: "messages exceeding
/// `max_message_bytes` fail with a framing error and the connection is
/// closed"). Returns the frame plus the total bytes read (header +
/// payload), or `None` on a clean EOF before any bytes of a new frame
/// arrive.
fn read_frame(reader: &mut &TcpStream, max_message_bytes: usize) -> Result<Option<(wire::Frame, usize)>> {
    let mut length_prefix = [0u8; 4];
    match reader.read_exact(&mut length_prefix) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Io(e)),
    }
    let length = u32::from_be_bytes(length_prefix) as usize;
    if length < 5 {
        return Err(Error::Protocol(format!("frame length {length} < 5")));
    }
    if 4 + length > max_message_bytes {
        return Err(Error::Protocol(format!("frame of {length} bytes exceeds max_message_bytes")));
    }
    let mut rest = vec![0u8; length];
    reader.read_exact(&mut rest)?;

    let mut buf = Vec::with_capacity(4 + length);
    buf.extend_from_slice(&length_prefix);
    buf.extend_from_slice(&rest);
    let (frame, consumed) = wire::decode_frame(&buf)?;
    Ok(Some((frame, consumed)))
}

/// Executes one request against `engine`, returning the response message
/// type and payload. Engine-level failures are always translated to a
/// `RESPONSE`/`ErrorResponse` frame (spec.md §6: "Error responses use
/// `msg_type=128`"); the third element carries the originating error back
/// to the caller only when the connection must be closed after it's sent
/// (spec.md §7: unrecoverable `Protocol`/`Internal` errors).
fn dispatch(engine: &Engine, frame: wire::Frame) -> (MessageType, Vec<u8>, Option<Error>) {
    match handle(engine, &frame) {
        Ok((msg_type, payload)) => (msg_type, payload, None),
        Err(err) => {
            let payload = ErrorResponse::from_error(&err).encode();
            let close_after = (!err.is_recoverable()).then_some(err);
            (MessageType::Response, payload, close_after)
        }
    }
}

fn handle(engine: &Engine, frame: &wire::Frame) -> Result<(MessageType, Vec<u8>)> {
    match frame.msg_type {
        MessageType::Add => {
            let req = AddRequest::decode(&frame.payload)?;
            engine.add(req.data)?;
            Ok((MessageType::Response, StatusResponse::ok().encode()))
        }
        MessageType::Search => {
            let req = SearchRequest::decode(&frame.payload)?;
            let hits = engine.search(req.metric, &req.data, req.k as usize)?;
            let response = SearchResponse { hits: hits.into_iter().map(|h| (h.id, h.distance)).collect() };
            Ok((MessageType::Response, response.encode()))
        }
        MessageType::Delete => {
            let req = DeleteRequest::decode(&frame.payload)?;
            engine.delete(req.id);
            Ok((MessageType::Response, StatusResponse::ok().encode()))
        }
        MessageType::Update => {
            let req = UpdateRequest::decode(&frame.payload)?;
            engine.update(req.id, req.data)?;
            Ok((MessageType::Response, StatusResponse::ok().encode()))
        }
        MessageType::Get => {
            let req = GetRequest::decode(&frame.payload)?;
            let data = engine.get(req.id)?;
            Ok((MessageType::Response, GetResponse { data }.encode()))
        }
        MessageType::BatchAdd => {
            let req = BatchAddRequest::decode(&frame.payload)?;
            engine.batch_add(req.vectors)?;
            Ok((MessageType::Response, StatusResponse::ok().encode()))
        }
        MessageType::BatchSearch => {
            let req = BatchSearchRequest::decode(&frame.payload)?;
            let results = engine.batch_search(req.metric, &req.queries, req.k as usize)?;
            let response = BatchSearchResponse {
                results: results.into_iter().map(|hits| hits.into_iter().map(|h| (h.id, h.distance)).collect()).collect(),
            };
            Ok((MessageType::Response, response.encode()))
        }
        MessageType::Stats => {
            let (total_requests, active_connections, bytes_sent, bytes_received) = engine.stats();
            let response = StatsResponse { total_requests, active_connections, bytes_sent, bytes_received };
            Ok((MessageType::Response, response.encode()))
        }
        MessageType::Health => Ok((MessageType::Response, HealthResponse { health: engine.health() }.encode())),
        MessageType::Save => {
            let req = SaveRequest::decode(&frame.payload)?;
            engine.save(req.path.as_deref())?;
            Ok((MessageType::Response, StatusResponse::ok().encode()))
        }
        MessageType::Response => Err(Error::Protocol("client sent a RESPONSE-typed frame".to_string())),
    }
}
