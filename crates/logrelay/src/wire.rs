// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire codec for the `Log(list<LogEntry>) -> ResultCode` call.
//!
//! Messages use the Thrift binary protocol inside a 4-byte big-endian length
//! frame. Only the pieces the `Log` call needs are implemented; unknown fields
//! are skipped so newer peers can add fields without breaking older ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::entry::{LogEntry, ResultCode};

pub const LOG_METHOD: &str = "Log";

/// Upper bound on a single frame. Larger frames are rejected by the codec.
pub const MAX_FRAME_LENGTH: usize = 256 * 1024 * 1024;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;
const MAX_SKIP_DEPTH: usize = 64;

const TYPE_STOP: u8 = 0;
const TYPE_BOOL: u8 = 2;
const TYPE_BYTE: u8 = 3;
const TYPE_DOUBLE: u8 = 4;
const TYPE_I16: u8 = 6;
const TYPE_I32: u8 = 8;
const TYPE_I64: u8 = 10;
const TYPE_STRING: u8 = 11;
const TYPE_STRUCT: u8 = 12;
const TYPE_MAP: u8 = 13;
const TYPE_SET: u8 = 14;
const TYPE_LIST: u8 = 15;

/// Application exception kind for an unrecognised method name.
pub const EXCEPTION_UNKNOWN_METHOD: i32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl MessageType {
    fn as_u8(self) -> u8 {
        match self {
            MessageType::Call => 1,
            MessageType::Reply => 2,
            MessageType::Exception => 3,
            MessageType::Oneway => 4,
        }
    }

    fn from_u8(value: u8) -> Result<Self, WireError> {
        match value {
            1 => Ok(MessageType::Call),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Exception),
            4 => Ok(MessageType::Oneway),
            other => Err(WireError::BadMessageType(other)),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Unexpected end of message")]
    Truncated,

    #[error("Bad protocol version: {0:#x}")]
    BadVersion(u32),

    #[error("Bad message type: {0}")]
    BadMessageType(u8),

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Unexpected message type: {0:?}")]
    UnexpectedMessageType(MessageType),

    #[error("Invalid field type {field_type} for field {id}")]
    InvalidFieldType { id: i16, field_type: u8 },

    #[error("Negative length: {0}")]
    NegativeLength(i32),

    #[error("Nesting too deep while skipping field")]
    TooDeep,

    #[error("Unknown result code: {0}")]
    UnknownResultCode(i32),

    #[error("Reply carried no result")]
    MissingResult,

    #[error("Remote exception ({kind}): {message}")]
    Remote { kind: i32, message: String },
}

/// Header of any decoded message.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub message_type: MessageType,
    pub seqid: i32,
}

/// Wraps a byte stream in the length framing used by the `Log` call.
pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> Framed<T, LengthDelimitedCodec> {
    let codec = LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LENGTH)
        .big_endian()
        .new_codec();
    Framed::new(io, codec)
}

pub fn encode_log_call(seqid: i32, entries: &[LogEntry]) -> Bytes {
    let mut buf = BytesMut::with_capacity(
        64 + entries
            .iter()
            .map(|e| e.category.len() + e.message.len() + 16)
            .sum::<usize>(),
    );
    write_header(&mut buf, LOG_METHOD, MessageType::Call, seqid);

    // Log_args { 1: list<LogEntry> messages }
    write_field_begin(&mut buf, TYPE_LIST, 1);
    buf.put_u8(TYPE_STRUCT);
    buf.put_i32(len_i32(entries.len()));
    for entry in entries {
        write_field_begin(&mut buf, TYPE_STRING, 1);
        write_binary(&mut buf, entry.category.as_bytes());
        write_field_begin(&mut buf, TYPE_STRING, 2);
        write_binary(&mut buf, &entry.message);
        buf.put_u8(TYPE_STOP);
    }
    buf.put_u8(TYPE_STOP);
    buf.freeze()
}

pub fn encode_log_reply(seqid: i32, code: ResultCode) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    write_header(&mut buf, LOG_METHOD, MessageType::Reply, seqid);
    // Log_result { 0: ResultCode success }
    write_field_begin(&mut buf, TYPE_I32, 0);
    buf.put_i32(code.as_i32());
    buf.put_u8(TYPE_STOP);
    buf.freeze()
}

pub fn encode_exception(seqid: i32, name: &str, kind: i32, message: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(32 + name.len() + message.len());
    write_header(&mut buf, name, MessageType::Exception, seqid);
    write_field_begin(&mut buf, TYPE_STRING, 1);
    write_binary(&mut buf, message.as_bytes());
    write_field_begin(&mut buf, TYPE_I32, 2);
    buf.put_i32(kind);
    buf.put_u8(TYPE_STOP);
    buf.freeze()
}

/// Decodes only the message header, e.g. to answer a call it can't serve.
pub fn decode_header(mut buf: &[u8]) -> Result<MessageHeader, WireError> {
    read_header(&mut buf)
}

/// Decodes a `Log` call, returning its header and entries.
pub fn decode_log_call(mut buf: &[u8]) -> Result<(MessageHeader, Vec<LogEntry>), WireError> {
    let header = read_header(&mut buf)?;
    if header.message_type != MessageType::Call && header.message_type != MessageType::Oneway {
        return Err(WireError::UnexpectedMessageType(header.message_type));
    }
    if header.name != LOG_METHOD {
        return Err(WireError::UnknownMethod(header.name));
    }

    let mut entries = Vec::new();
    loop {
        let (field_type, id) = read_field_begin(&mut buf)?;
        if field_type == TYPE_STOP {
            break;
        }
        if id == 1 && field_type == TYPE_LIST {
            let (elem_type, size) = read_list_begin(&mut buf)?;
            if elem_type != TYPE_STRUCT {
                return Err(WireError::InvalidFieldType {
                    id,
                    field_type: elem_type,
                });
            }
            entries.reserve(size.min(buf.remaining()));
            for _ in 0..size {
                entries.push(read_log_entry(&mut buf)?);
            }
        } else {
            skip(&mut buf, field_type, 0)?;
        }
    }
    Ok((header, entries))
}

/// Decodes the reply to a `Log` call.
pub fn decode_log_reply(mut buf: &[u8]) -> Result<(i32, ResultCode), WireError> {
    let header = read_header(&mut buf)?;
    match header.message_type {
        MessageType::Reply => {}
        MessageType::Exception => return Err(read_exception(&mut buf)?),
        other => return Err(WireError::UnexpectedMessageType(other)),
    }

    let mut result = None;
    loop {
        let (field_type, id) = read_field_begin(&mut buf)?;
        if field_type == TYPE_STOP {
            break;
        }
        if id == 0 && field_type == TYPE_I32 {
            let code = read_i32(&mut buf)?;
            result = Some(ResultCode::from_i32(code).ok_or(WireError::UnknownResultCode(code))?);
        } else {
            skip(&mut buf, field_type, 0)?;
        }
    }
    result
        .map(|code| (header.seqid, code))
        .ok_or(WireError::MissingResult)
}

fn read_log_entry(buf: &mut &[u8]) -> Result<LogEntry, WireError> {
    let mut category = String::new();
    let mut message = Vec::new();
    loop {
        let (field_type, id) = read_field_begin(buf)?;
        if field_type == TYPE_STOP {
            break;
        }
        match (id, field_type) {
            (1, TYPE_STRING) => {
                category = String::from_utf8_lossy(&read_binary(buf)?).into_owned();
            }
            (2, TYPE_STRING) => message = read_binary(buf)?,
            _ => skip(buf, field_type, 0)?,
        }
    }
    Ok(LogEntry { category, message })
}

fn read_exception(buf: &mut &[u8]) -> Result<WireError, WireError> {
    let mut message = String::new();
    let mut kind = 0;
    loop {
        let (field_type, id) = read_field_begin(buf)?;
        if field_type == TYPE_STOP {
            break;
        }
        match (id, field_type) {
            (1, TYPE_STRING) => message = String::from_utf8_lossy(&read_binary(buf)?).into_owned(),
            (2, TYPE_I32) => kind = read_i32(buf)?,
            _ => skip(buf, field_type, 0)?,
        }
    }
    Ok(WireError::Remote { kind, message })
}

fn write_header(buf: &mut BytesMut, name: &str, message_type: MessageType, seqid: i32) {
    buf.put_u32(VERSION_1 | u32::from(message_type.as_u8()));
    write_binary(buf, name.as_bytes());
    buf.put_i32(seqid);
}

fn write_field_begin(buf: &mut BytesMut, field_type: u8, id: i16) {
    buf.put_u8(field_type);
    buf.put_i16(id);
}

fn write_binary(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(len_i32(data.len()));
    buf.put_slice(data);
}

fn len_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

fn read_header(buf: &mut &[u8]) -> Result<MessageHeader, WireError> {
    let first = read_i32(buf)?;
    if first < 0 {
        // strict: version word followed by name and seqid
        let word = first as u32;
        if word & VERSION_MASK != VERSION_1 {
            return Err(WireError::BadVersion(word & VERSION_MASK));
        }
        let message_type = MessageType::from_u8((word & 0xff) as u8)?;
        let name_len = first_len(read_i32(buf)?)?;
        let name = String::from_utf8_lossy(&read_bytes(buf, name_len)?).into_owned();
        let seqid = read_i32(buf)?;
        Ok(MessageHeader {
            name,
            message_type,
            seqid,
        })
    } else {
        // non-strict: name length, name, type byte, seqid
        let name = String::from_utf8_lossy(&read_bytes(buf, first_len(first)?)?).into_owned();
        let message_type = MessageType::from_u8(read_u8(buf)?)?;
        let seqid = read_i32(buf)?;
        Ok(MessageHeader {
            name,
            message_type,
            seqid,
        })
    }
}

fn first_len(len: i32) -> Result<usize, WireError> {
    usize::try_from(len).map_err(|_| WireError::NegativeLength(len))
}

fn read_field_begin(buf: &mut &[u8]) -> Result<(u8, i16), WireError> {
    let field_type = read_u8(buf)?;
    if field_type == TYPE_STOP {
        return Ok((TYPE_STOP, 0));
    }
    Ok((field_type, read_i16(buf)?))
}

fn read_list_begin(buf: &mut &[u8]) -> Result<(u8, usize), WireError> {
    let elem_type = read_u8(buf)?;
    let size = first_len(read_i32(buf)?)?;
    Ok((elem_type, size))
}

fn read_binary(buf: &mut &[u8]) -> Result<Vec<u8>, WireError> {
    let len = first_len(read_i32(buf)?)?;
    read_bytes(buf, len)
}

fn read_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>, WireError> {
    ensure(buf, len)?;
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

fn ensure(buf: &&[u8], len: usize) -> Result<(), WireError> {
    if buf.remaining() < len {
        return Err(WireError::Truncated);
    }
    Ok(())
}

fn read_u8(buf: &mut &[u8]) -> Result<u8, WireError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn read_i16(buf: &mut &[u8]) -> Result<i16, WireError> {
    ensure(buf, 2)?;
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, WireError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

fn skip_bytes(buf: &mut &[u8], len: usize) -> Result<(), WireError> {
    ensure(buf, len)?;
    buf.advance(len);
    Ok(())
}

fn skip(buf: &mut &[u8], field_type: u8, depth: usize) -> Result<(), WireError> {
    if depth > MAX_SKIP_DEPTH {
        return Err(WireError::TooDeep);
    }
    match field_type {
        TYPE_BOOL | TYPE_BYTE => skip_bytes(buf, 1),
        TYPE_I16 => skip_bytes(buf, 2),
        TYPE_I32 => skip_bytes(buf, 4),
        TYPE_DOUBLE | TYPE_I64 => skip_bytes(buf, 8),
        TYPE_STRING => {
            let len = first_len(read_i32(buf)?)?;
            skip_bytes(buf, len)
        }
        TYPE_STRUCT => loop {
            let (inner, _) = read_field_begin(buf)?;
            if inner == TYPE_STOP {
                return Ok(());
            }
            skip(buf, inner, depth + 1)?;
        },
        TYPE_MAP => {
            let key_type = read_u8(buf)?;
            let value_type = read_u8(buf)?;
            let size = first_len(read_i32(buf)?)?;
            for _ in 0..size {
                skip(buf, key_type, depth + 1)?;
                skip(buf, value_type, depth + 1)?;
            }
            Ok(())
        }
        TYPE_SET | TYPE_LIST => {
            let (elem_type, size) = read_list_begin(buf)?;
            for _ in 0..size {
                skip(buf, elem_type, depth + 1)?;
            }
            Ok(())
        }
        other => Err(WireError::InvalidFieldType {
            id: -1,
            field_type: other,
        }),
    }
}
