//! The control channel wire codec.
//!
//! Implements the RESP array framing of the `CLUSTER SYNCSLOTS` subcommand
//! vocabulary (spec §4.6, §6) as a [`tokio_util::codec::{Encoder, Decoder}`]
//! pair. This is deliberately narrow: it frames only the migration-specific
//! verbs, not the general RESP type system (the full wire codec is an
//! external collaborator per §1).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use slotstore_core::{MigrationJobName, NodeId, SlotRangeList};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("malformed RESP frame: {0}")]
    Protocol(String),
}

/// The single-line reply to `ESTABLISH`; no other verb replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespReply {
    Ok,
    Err(String),
}

/// One message on the `SYNCSLOTS` control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncSlotsFrame {
    Establish {
        source: NodeId,
        name: MigrationJobName,
        ranges: SlotRangeList,
    },
    Ack,
    SnapshotEof,
    RequestPause,
    Paused,
    RequestFailover,
    FailoverGranted,
    Reply(RespReply),
    /// A subcommand the codec doesn't recognise. A session already bound
    /// to an in-progress job fails it on receipt of one of these (§4.6).
    Unknown(Vec<Bytes>),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncSlotsCodec;

impl Decoder for SyncSlotsCodec {
    type Item = SyncSlotsFrame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        match src[0] {
            b'+' | b'-' => decode_simple_reply(src),
            b'*' => decode_array(src),
            other => Err(WireError::Protocol(format!(
                "unexpected leading byte {other:#x}"
            ))),
        }
    }
}

impl Encoder<SyncSlotsFrame> for SyncSlotsCodec {
    type Error = WireError;

    fn encode(&mut self, frame: SyncSlotsFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match frame {
            SyncSlotsFrame::Reply(RespReply::Ok) => dst.extend_from_slice(b"+OK\r\n"),
            SyncSlotsFrame::Reply(RespReply::Err(msg)) => {
                dst.extend_from_slice(b"-ERR ");
                dst.extend_from_slice(msg.as_bytes());
                dst.extend_from_slice(b"\r\n");
            }
            other => {
                let args = frame_to_args(&other);
                encode_array(&args, dst);
            }
        }
        Ok(())
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn decode_simple_reply(src: &mut BytesMut) -> Result<Option<SyncSlotsFrame>, WireError> {
    let Some(end) = find_crlf(src) else {
        return Ok(None);
    };
    let line = src.split_to(end + 2);
    let text = std::str::from_utf8(&line[1..end])
        .map_err(|e| WireError::Protocol(e.to_string()))?
        .to_string();
    let reply = match line[0] {
        b'+' => RespReply::Ok,
        b'-' => RespReply::Err(text),
        _ => unreachable!("caller dispatched on leading byte"),
    };
    Ok(Some(SyncSlotsFrame::Reply(reply)))
}

/// Parses a RESP array of bulk strings without consuming `src` unless the
/// whole frame is present, so partial reads leave the buffer untouched for
/// the next `decode` call.
fn decode_array(src: &mut BytesMut) -> Result<Option<SyncSlotsFrame>, WireError> {
    let buf = &src[..];
    let Some(header_end) = find_crlf(buf) else {
        return Ok(None);
    };
    let count: usize = std::str::from_utf8(&buf[1..header_end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireError::Protocol("bad array header".into()))?;

    let mut cursor = header_end + 2;
    let mut elements = Vec::with_capacity(count);
    for _ in 0..count {
        if cursor >= buf.len() || buf[cursor] != b'$' {
            return Ok(None);
        }
        let Some(rel_end) = find_crlf(&buf[cursor..]) else {
            return Ok(None);
        };
        let len_end = cursor + rel_end;
        let len: usize = std::str::from_utf8(&buf[cursor + 1..len_end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| WireError::Protocol("bad bulk length".into()))?;
        let data_start = len_end + 2;
        let data_end = data_start + len;
        if data_end + 2 > buf.len() {
            return Ok(None);
        }
        elements.push(Bytes::copy_from_slice(&buf[data_start..data_end]));
        cursor = data_end + 2;
    }

    src.advance(cursor);
    Ok(Some(parse_frame(elements)?))
}

fn ascii_eq(a: &[u8], word: &str) -> bool {
    a.eq_ignore_ascii_case(word.as_bytes())
}

fn parse_frame(elements: Vec<Bytes>) -> Result<SyncSlotsFrame, WireError> {
    if elements.len() < 3 || !ascii_eq(&elements[0], "CLUSTER") || !ascii_eq(&elements[1], "SYNCSLOTS") {
        return Ok(SyncSlotsFrame::Unknown(elements));
    }
    let verb = &elements[2];
    if ascii_eq(verb, "ACK") {
        return Ok(SyncSlotsFrame::Ack);
    }
    if ascii_eq(verb, "SNAPSHOT-EOF") {
        return Ok(SyncSlotsFrame::SnapshotEof);
    }
    if ascii_eq(verb, "REQUEST-PAUSE") {
        return Ok(SyncSlotsFrame::RequestPause);
    }
    if ascii_eq(verb, "PAUSED") {
        return Ok(SyncSlotsFrame::Paused);
    }
    if ascii_eq(verb, "REQUEST-FAILOVER") {
        return Ok(SyncSlotsFrame::RequestFailover);
    }
    if ascii_eq(verb, "FAILOVER-GRANTED") {
        return Ok(SyncSlotsFrame::FailoverGranted);
    }
    if ascii_eq(verb, "ESTABLISH") {
        return parse_establish(&elements).map_err(|_| {
            WireError::Protocol("malformed ESTABLISH payload".into())
        }).map(|v| v.unwrap_or(SyncSlotsFrame::Unknown(elements)));
    }
    Ok(SyncSlotsFrame::Unknown(elements))
}

fn parse_establish(elements: &[Bytes]) -> Result<Option<SyncSlotsFrame>, ()> {
    // elements: CLUSTER SYNCSLOTS ESTABLISH SOURCE <id> NAME <id> SLOTSRANGE <s> <e> ...
    if elements.len() < 8 {
        return Ok(None);
    }
    if !ascii_eq(&elements[3], "SOURCE") || !ascii_eq(&elements[5], "NAME") || !ascii_eq(&elements[7], "SLOTSRANGE") {
        return Ok(None);
    }
    let source_str = std::str::from_utf8(&elements[4]).map_err(|_| ())?;
    let name_str = std::str::from_utf8(&elements[6]).map_err(|_| ())?;
    let source: NodeId = source_str.parse().map_err(|_| ())?;
    let name: MigrationJobName = name_str.parse().map_err(|_| ())?;

    let pair_tokens = &elements[8..];
    if pair_tokens.len() % 2 != 0 {
        return Err(());
    }
    let tokens: Vec<String> = pair_tokens
        .iter()
        .map(|b| String::from_utf8_lossy(b).into_owned())
        .collect();
    let refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
    let ranges = SlotRangeList::parse(&refs).map_err(|_| ())?;

    Ok(Some(SyncSlotsFrame::Establish { source, name, ranges }))
}

fn frame_to_args(frame: &SyncSlotsFrame) -> Vec<Bytes> {
    let mut args: Vec<Bytes> = vec![
        Bytes::from_static(b"CLUSTER"),
        Bytes::from_static(b"SYNCSLOTS"),
    ];
    match frame {
        SyncSlotsFrame::Establish { source, name, ranges } => {
            args.push(Bytes::from_static(b"ESTABLISH"));
            args.push(Bytes::from_static(b"SOURCE"));
            args.push(Bytes::from(source.to_string()));
            args.push(Bytes::from_static(b"NAME"));
            args.push(Bytes::from(name.to_string()));
            args.push(Bytes::from_static(b"SLOTSRANGE"));
            for range in ranges.ranges() {
                args.push(Bytes::from(range.start().to_string()));
                args.push(Bytes::from(range.end().to_string()));
            }
        }
        SyncSlotsFrame::Ack => args.push(Bytes::from_static(b"ACK")),
        SyncSlotsFrame::SnapshotEof => args.push(Bytes::from_static(b"SNAPSHOT-EOF")),
        SyncSlotsFrame::RequestPause => args.push(Bytes::from_static(b"REQUEST-PAUSE")),
        SyncSlotsFrame::Paused => args.push(Bytes::from_static(b"PAUSED")),
        SyncSlotsFrame::RequestFailover => args.push(Bytes::from_static(b"REQUEST-FAILOVER")),
        SyncSlotsFrame::FailoverGranted => args.push(Bytes::from_static(b"FAILOVER-GRANTED")),
        SyncSlotsFrame::Reply(_) | SyncSlotsFrame::Unknown(_) => {
            unreachable!("handled before frame_to_args is called")
        }
    }
    args
}

fn encode_array(args: &[Bytes], dst: &mut BytesMut) {
    dst.put_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        dst.put_slice(format!("${}\r\n", arg.len()).as_bytes());
        dst.put_slice(arg);
        dst.put_slice(b"\r\n");
    }
}

use crate::cluster::collab::{Session, SessionError};

/// Flushes `send_buf` to `session`, advancing past whatever the socket
/// accepted this tick. Safe to call with an empty buffer.
pub fn pump_write(session: &mut dyn Session, send_buf: &mut BytesMut) -> Result<(), SessionError> {
    while !send_buf.is_empty() {
        match session.try_write(send_buf)? {
            0 => break,
            n => {
                send_buf.advance(n);
            }
        }
    }
    Ok(())
}

/// Pulls whatever bytes `session` has ready into `recv_buf`.
pub fn pump_read(session: &mut dyn Session, recv_buf: &mut BytesMut) -> Result<(), SessionError> {
    let mut tmp = BytesMut::with_capacity(4096);
    if session.try_read(&mut tmp)? > 0 {
        recv_buf.unsplit(tmp);
    }
    Ok(())
}

/// Encodes `frame` onto `send_buf` for the next [`pump_write`] to drain.
pub fn enqueue(
    codec: &mut SyncSlotsCodec,
    send_buf: &mut BytesMut,
    frame: SyncSlotsFrame,
) -> Result<(), WireError> {
    codec.encode(frame, send_buf)
}
