// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Binary encoding of flow batches.
//!
//! A batch is a protobuf message (`seq` plus repeated embedded `record`
//! messages) written with [`CodedOutputStream`]. On the wire each batch is
//! framed as:
//!
//! ```text
//! +----------------+--------------------+-----------------+
//! | len: u32 (BE)  | session id: u64 BE | payload (len B) |
//! +----------------+--------------------+-----------------+
//! ```
//!
//! The frame may additionally be zstd-compressed as a whole by the dispatcher.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use protobuf::{CodedInputStream, CodedOutputStream};
use ustr::Ustr;

use crate::flow::{Custom, CustomValue, Flow};

pub const FRAME_HEADER_LEN: usize = 12;

const BATCH_SEQ: u32 = 1;
const BATCH_RECORD: u32 = 2;

const FLOW_DEVICE_ID: u32 = 1;
const FLOW_SAMPLE_RATE: u32 = 2;
const FLOW_SAMPLE_ADJ: u32 = 3;
const FLOW_TIMESTAMP: u32 = 4;
const FLOW_SRC_ADDR: u32 = 5;
const FLOW_DST_ADDR: u32 = 6;
const FLOW_SRC_PORT: u32 = 7;
const FLOW_DST_PORT: u32 = 8;
const FLOW_PROTOCOL: u32 = 9;
const FLOW_TCP_FLAGS: u32 = 10;
const FLOW_TOS: u32 = 11;
const FLOW_IN_BYTES: u32 = 12;
const FLOW_IN_PKTS: u32 = 13;
const FLOW_OUT_BYTES: u32 = 14;
const FLOW_OUT_PKTS: u32 = 15;
const FLOW_INPUT_PORT: u32 = 16;
const FLOW_OUTPUT_PORT: u32 = 17;
const FLOW_VLAN_IN: u32 = 18;
const FLOW_VLAN_OUT: u32 = 19;
const FLOW_SRC_AS: u32 = 20;
const FLOW_DST_AS: u32 = 21;
const FLOW_NEXT_HOP: u32 = 22;
const FLOW_CUSTOM: u32 = 23;

const CUSTOM_ID: u32 = 1;
const CUSTOM_STR: u32 = 2;
const CUSTOM_U32: u32 = 3;
const CUSTOM_U64: u32 = 4;
const CUSTOM_I64: u32 = 5;
const CUSTOM_BOOL: u32 = 6;
const CUSTOM_ADDR: u32 = 7;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Protobuf(#[from] protobuf::Error),
    #[error("unknown field {field} in {message}")]
    UnknownField { message: &'static str, field: u32 },
    #[error("invalid address of {0} bytes")]
    InvalidAddress(usize),
    #[error("custom field without a value")]
    MissingCustomValue,
    #[error("frame is truncated")]
    Truncated,
}

/// A decoded batch payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DecodedBatch {
    pub seq: u64,
    pub flows: Vec<Flow>,
}

/// Encodes the records of one batch into its payload bytes.
pub fn encode_batch(seq: u64, flows: &[Flow]) -> Result<Vec<u8>, protobuf::Error> {
    let mut out = Vec::new();
    let mut record = Vec::new();
    {
        let mut os = CodedOutputStream::vec(&mut out);
        os.write_uint64(BATCH_SEQ, seq)?;
        for flow in flows {
            record.clear();
            encode_flow(flow, &mut record)?;
            os.write_bytes(BATCH_RECORD, &record)?;
        }
        os.flush()?;
    }
    Ok(out)
}

fn encode_flow(flow: &Flow, out: &mut Vec<u8>) -> Result<(), protobuf::Error> {
    let mut custom = Vec::new();
    let mut os = CodedOutputStream::vec(out);

    write_u32(&mut os, FLOW_DEVICE_ID, flow.device_id)?;
    write_u32(&mut os, FLOW_SAMPLE_RATE, flow.sample_rate)?;
    if flow.sample_adj {
        os.write_bool(FLOW_SAMPLE_ADJ, true)?;
    }
    if flow.timestamp != 0 {
        os.write_int64(FLOW_TIMESTAMP, flow.timestamp)?;
    }
    write_addr(&mut os, FLOW_SRC_ADDR, flow.src_addr)?;
    write_addr(&mut os, FLOW_DST_ADDR, flow.dst_addr)?;
    write_u32(&mut os, FLOW_SRC_PORT, flow.src_port)?;
    write_u32(&mut os, FLOW_DST_PORT, flow.dst_port)?;
    write_u32(&mut os, FLOW_PROTOCOL, flow.protocol)?;
    write_u32(&mut os, FLOW_TCP_FLAGS, flow.tcp_flags)?;
    write_u32(&mut os, FLOW_TOS, flow.tos)?;
    write_u64(&mut os, FLOW_IN_BYTES, flow.in_bytes)?;
    write_u64(&mut os, FLOW_IN_PKTS, flow.in_pkts)?;
    write_u64(&mut os, FLOW_OUT_BYTES, flow.out_bytes)?;
    write_u64(&mut os, FLOW_OUT_PKTS, flow.out_pkts)?;
    write_u32(&mut os, FLOW_INPUT_PORT, flow.input_port)?;
    write_u32(&mut os, FLOW_OUTPUT_PORT, flow.output_port)?;
    write_u32(&mut os, FLOW_VLAN_IN, flow.vlan_in)?;
    write_u32(&mut os, FLOW_VLAN_OUT, flow.vlan_out)?;
    write_u32(&mut os, FLOW_SRC_AS, flow.src_as)?;
    write_u32(&mut os, FLOW_DST_AS, flow.dst_as)?;
    write_addr(&mut os, FLOW_NEXT_HOP, flow.next_hop)?;

    for c in &flow.customs {
        custom.clear();
        encode_custom(c, &mut custom)?;
        os.write_bytes(FLOW_CUSTOM, &custom)?;
    }
    os.flush()
}

fn encode_custom(custom: &Custom, out: &mut Vec<u8>) -> Result<(), protobuf::Error> {
    let mut os = CodedOutputStream::vec(out);
    os.write_uint32(CUSTOM_ID, custom.id)?;
    match &custom.value {
        CustomValue::Str(s) => os.write_string(CUSTOM_STR, s.as_str())?,
        CustomValue::U32(v) => os.write_uint32(CUSTOM_U32, *v)?,
        CustomValue::U64(v) => os.write_uint64(CUSTOM_U64, *v)?,
        CustomValue::I64(v) => os.write_int64(CUSTOM_I64, *v)?,
        CustomValue::Bool(v) => os.write_bool(CUSTOM_BOOL, *v)?,
        CustomValue::Addr(addr) => os.write_bytes(CUSTOM_ADDR, &addr_bytes(*addr))?,
    }
    os.flush()
}

fn write_u32(os: &mut CodedOutputStream<'_>, field: u32, value: u32) -> Result<(), protobuf::Error> {
    if value != 0 {
        os.write_uint32(field, value)?;
    }
    Ok(())
}

fn write_u64(os: &mut CodedOutputStream<'_>, field: u32, value: u64) -> Result<(), protobuf::Error> {
    if value != 0 {
        os.write_uint64(field, value)?;
    }
    Ok(())
}

fn write_addr(
    os: &mut CodedOutputStream<'_>,
    field: u32,
    addr: Option<IpAddr>,
) -> Result<(), protobuf::Error> {
    if let Some(addr) = addr {
        os.write_bytes(field, &addr_bytes(addr))?;
    }
    Ok(())
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn parse_addr(bytes: &[u8]) -> Result<IpAddr, DecodeError> {
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        n => Err(DecodeError::InvalidAddress(n)),
    }
}

/// Decodes a batch payload produced by [`encode_batch`].
pub fn decode_batch(payload: &[u8]) -> Result<DecodedBatch, DecodeError> {
    let mut batch = DecodedBatch::default();
    let mut is = CodedInputStream::from_bytes(payload);
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            BATCH_SEQ => batch.seq = is.read_uint64()?,
            BATCH_RECORD => {
                let record = is.read_bytes()?;
                batch.flows.push(decode_flow(&record)?);
            }
            field => {
                return Err(DecodeError::UnknownField {
                    message: "batch",
                    field,
                })
            }
        }
    }
    Ok(batch)
}

fn decode_flow(bytes: &[u8]) -> Result<Flow, DecodeError> {
    let mut flow = Flow::default();
    let mut is = CodedInputStream::from_bytes(bytes);
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            FLOW_DEVICE_ID => flow.device_id = is.read_uint32()?,
            FLOW_SAMPLE_RATE => flow.sample_rate = is.read_uint32()?,
            FLOW_SAMPLE_ADJ => flow.sample_adj = is.read_bool()?,
            FLOW_TIMESTAMP => flow.timestamp = is.read_int64()?,
            FLOW_SRC_ADDR => flow.src_addr = Some(parse_addr(&is.read_bytes()?)?),
            FLOW_DST_ADDR => flow.dst_addr = Some(parse_addr(&is.read_bytes()?)?),
            FLOW_SRC_PORT => flow.src_port = is.read_uint32()?,
            FLOW_DST_PORT => flow.dst_port = is.read_uint32()?,
            FLOW_PROTOCOL => flow.protocol = is.read_uint32()?,
            FLOW_TCP_FLAGS => flow.tcp_flags = is.read_uint32()?,
            FLOW_TOS => flow.tos = is.read_uint32()?,
            FLOW_IN_BYTES => flow.in_bytes = is.read_uint64()?,
            FLOW_IN_PKTS => flow.in_pkts = is.read_uint64()?,
            FLOW_OUT_BYTES => flow.out_bytes = is.read_uint64()?,
            FLOW_OUT_PKTS => flow.out_pkts = is.read_uint64()?,
            FLOW_INPUT_PORT => flow.input_port = is.read_uint32()?,
            FLOW_OUTPUT_PORT => flow.output_port = is.read_uint32()?,
            FLOW_VLAN_IN => flow.vlan_in = is.read_uint32()?,
            FLOW_VLAN_OUT => flow.vlan_out = is.read_uint32()?,
            FLOW_SRC_AS => flow.src_as = is.read_uint32()?,
            FLOW_DST_AS => flow.dst_as = is.read_uint32()?,
            FLOW_NEXT_HOP => flow.next_hop = Some(parse_addr(&is.read_bytes()?)?),
            FLOW_CUSTOM => flow.customs.push(decode_custom(&is.read_bytes()?)?),
            field => {
                return Err(DecodeError::UnknownField {
                    message: "record",
                    field,
                })
            }
        }
    }
    Ok(flow)
}

fn decode_custom(bytes: &[u8]) -> Result<Custom, DecodeError> {
    let mut id = 0;
    let mut value = None;
    let mut is = CodedInputStream::from_bytes(bytes);
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            CUSTOM_ID => id = is.read_uint32()?,
            CUSTOM_STR => value = Some(CustomValue::Str(Ustr::from(is.read_string()?.as_str()))),
            CUSTOM_U32 => value = Some(CustomValue::U32(is.read_uint32()?)),
            CUSTOM_U64 => value = Some(CustomValue::U64(is.read_uint64()?)),
            CUSTOM_I64 => value = Some(CustomValue::I64(is.read_int64()?)),
            CUSTOM_BOOL => value = Some(CustomValue::Bool(is.read_bool()?)),
            CUSTOM_ADDR => value = Some(CustomValue::Addr(parse_addr(&is.read_bytes()?)?)),
            field => {
                return Err(DecodeError::UnknownField {
                    message: "custom",
                    field,
                })
            }
        }
    }
    let value = value.ok_or(DecodeError::MissingCustomValue)?;
    Ok(Custom { id, value })
}

/// Wraps a payload in the length-prefixed frame sent to the collector.
#[must_use]
pub fn frame(session_id: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    // Payloads are bounded by the per-cycle budget, far below 4 GiB.
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&session_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Splits a frame into its session id and payload.
pub fn unframe(frame: &[u8]) -> Result<(u64, &[u8]), DecodeError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(DecodeError::Truncated);
    }
    let (header, rest) = frame.split_at(FRAME_HEADER_LEN);
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    let mut sid = [0u8; 8];
    sid.copy_from_slice(&header[4..]);
    let len = u32::from_be_bytes(len) as usize;
    if rest.len() < len {
        return Err(DecodeError::Truncated);
    }
    Ok((u64::from_be_bytes(sid), &rest[..len]))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_flow() -> Flow {
        Flow {
            device_id: 1001,
            sample_rate: 4,
            sample_adj: true,
            timestamp: 1_656_581_409,
            src_addr: Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))),
            dst_addr: Some(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            src_port: 443,
            dst_port: 51_234,
            protocol: 6,
            in_bytes: 1_500,
            in_pkts: 3,
            customs: vec![
                Custom::new(12, "edge-1"),
                Custom::new(13, 99u64),
                Custom::new(14, false),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_batch_decodes_to_same_records() {
        let flows = vec![sample_flow(), Flow::default()];
        let payload = encode_batch(7, &flows).unwrap();

        let decoded = decode_batch(&payload).unwrap();
        assert_eq!(decoded.seq, 7);
        assert_eq!(decoded.flows, flows);
    }

    #[test]
    fn test_empty_batch_only_carries_sequence() {
        let payload = encode_batch(3, &[]).unwrap();
        let decoded = decode_batch(&payload).unwrap();
        assert_eq!(decoded.seq, 3);
        assert!(decoded.flows.is_empty());
    }

    #[test]
    fn test_frame_header() {
        let framed = frame(0, b"payload");
        assert_eq!(framed.len(), FRAME_HEADER_LEN + 7);
        assert_eq!(&framed[..4], &7u32.to_be_bytes());

        let (sid, payload) = unframe(&framed).unwrap();
        assert_eq!(sid, 0);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_unframe_rejects_truncated_frames() {
        assert!(matches!(unframe(&[0, 0]), Err(DecodeError::Truncated)));

        let mut framed = frame(9, b"abcdef");
        framed.truncate(framed.len() - 1);
        assert!(matches!(unframe(&framed), Err(DecodeError::Truncated)));
    }

    #[test]
    fn test_decode_rejects_bad_address() {
        let mut record = Vec::new();
        {
            let mut os = CodedOutputStream::vec(&mut record);
            os.write_bytes(FLOW_SRC_ADDR, &[1, 2, 3]).unwrap();
            os.flush().unwrap();
        }
        assert!(matches!(
            decode_flow(&record),
            Err(DecodeError::InvalidAddress(3))
        ));
    }
}
