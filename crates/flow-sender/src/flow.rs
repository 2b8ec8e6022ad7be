// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The flow record handed to the sender by the capture source.
//!
//! A [`Flow`] carries a small control subset (`device_id`, `sample_rate`,
//! `sample_adj`) that the aggregator reads and rewrites, plus the flow
//! attributes that are only ever copied through to the encoded batch.

use std::net::IpAddr;

use derive_more::Display;
use ustr::Ustr;

/// One observed network flow.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Flow {
    /// Owning device, stamped by the sender.
    pub device_id: u32,
    /// Sampling already applied upstream: 1 means unsampled. 0 is read as 1.
    pub sample_rate: u32,
    /// Set once the sample rate has been rewritten by rate limiting.
    pub sample_adj: bool,

    pub timestamp: i64,
    pub src_addr: Option<IpAddr>,
    pub dst_addr: Option<IpAddr>,
    pub src_port: u32,
    pub dst_port: u32,
    pub protocol: u32,
    pub tcp_flags: u32,
    pub tos: u32,
    pub in_bytes: u64,
    pub in_pkts: u64,
    pub out_bytes: u64,
    pub out_pkts: u64,
    pub input_port: u32,
    pub output_port: u32,
    pub vlan_in: u32,
    pub vlan_out: u32,
    pub src_as: u32,
    pub dst_as: u32,
    pub next_hop: Option<IpAddr>,
    pub customs: Vec<Custom>,
}

impl Flow {
    /// The original sample rate, treating an unset rate as unsampled.
    #[must_use]
    pub fn effective_sample_rate(&self) -> u32 {
        self.sample_rate.max(1)
    }
}

/// A custom column value attached to a flow.
#[derive(Debug, Clone, PartialEq)]
pub struct Custom {
    /// Column id as assigned by the device API.
    pub id: u32,
    pub value: CustomValue,
}

impl Custom {
    #[must_use]
    pub fn new(id: u32, value: impl Into<CustomValue>) -> Self {
        Self {
            id,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Display)]
pub enum CustomValue {
    Str(Ustr),
    U32(u32),
    U64(u64),
    I64(i64),
    Bool(bool),
    Addr(IpAddr),
}

impl From<&str> for CustomValue {
    fn from(value: &str) -> Self {
        CustomValue::Str(Ustr::from(value))
    }
}

impl From<u32> for CustomValue {
    fn from(value: u32) -> Self {
        CustomValue::U32(value)
    }
}

impl From<u64> for CustomValue {
    fn from(value: u64) -> Self {
        CustomValue::U64(value)
    }
}

impl From<i64> for CustomValue {
    fn from(value: i64) -> Self {
        CustomValue::I64(value)
    }
}

impl From<bool> for CustomValue {
    fn from(value: bool) -> Self {
        CustomValue::Bool(value)
    }
}

impl From<IpAddr> for CustomValue {
    fn from(value: IpAddr) -> Self {
        CustomValue::Addr(value)
    }
}
