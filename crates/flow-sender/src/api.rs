// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device metadata lookups.
//!
//! The sender needs a device identity (id, client id) and its current rate
//! budget. [`DeviceLookup`] abstracts where that comes from; [`ApiClient`]
//! implements it against the collector's JSON device API:
//!
//! - `GET {api}/device/{id}` returns `{"device": {...}}`
//! - `GET {api}/devices` returns `{"devices": [...]}`
//!
//! 401 maps to [`Error::Unauthorized`], 404 to [`Error::DeviceNotFound`].

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use derive_more::Display;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use ustr::Ustr;

use crate::errors::Error;
use crate::http::{auth_headers, get_client};

/// Custom column name to column id.
pub type CustomColumns = HashMap<Ustr, u32, FnvBuildHasher>;

/// Identifier the collector uses to attribute flows: `company:name:id`.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("{company_id}:{name}:{id}")]
pub struct ClientId {
    company_id: u32,
    name: String,
    id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: u32,
    pub name: String,
    pub company_id: u32,
    /// Rate budget in flows per second; 0 is unlimited.
    pub max_flow_rate: u64,
    pub sample_rate: u32,
    pub sending_ips: Vec<IpAddr>,
    pub interfaces: Vec<Interface>,
    pub customs: CustomColumns,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Interface {
    #[serde(default, deserialize_with = "number_or_string")]
    pub snmp_id: u32,
    #[serde(default)]
    pub interface_description: String,
    #[serde(default)]
    pub snmp_alias: String,
}

impl Device {
    #[must_use]
    pub fn client_id(&self) -> ClientId {
        ClientId {
            company_id: self.company_id,
            name: self.name.clone(),
            id: self.id,
        }
    }

    /// Column id of a named custom field.
    #[must_use]
    pub fn custom_id(&self, name: &str) -> Option<u32> {
        self.customs.get(&Ustr::from(name)).copied()
    }

    #[must_use]
    pub fn sends_from(&self, ip: IpAddr) -> bool {
        self.sending_ips.contains(&ip)
    }

    #[must_use]
    pub fn has_interface(&self, name: &str) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.interface_description == name || i.snmp_alias == name)
    }
}

#[derive(Debug, Deserialize)]
struct ApiDevice {
    #[serde(deserialize_with = "number_or_string")]
    id: u32,
    #[serde(rename = "device_name")]
    name: String,
    #[serde(default, deserialize_with = "number_or_string")]
    company_id: u32,
    #[serde(default)]
    max_flow_rate: u64,
    #[serde(default, rename = "device_sample_rate", deserialize_with = "number_or_string")]
    sample_rate: u32,
    #[serde(default)]
    sending_ips: Vec<String>,
    #[serde(default)]
    interfaces: Vec<Interface>,
    #[serde(default)]
    customs: Vec<ApiCustomColumn>,
}

#[derive(Debug, Deserialize)]
struct ApiCustomColumn {
    #[serde(deserialize_with = "number_or_string")]
    id: u32,
    name: String,
}

impl From<ApiDevice> for Device {
    fn from(raw: ApiDevice) -> Self {
        let sending_ips = raw
            .sending_ips
            .iter()
            .filter_map(|ip| match ip.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    debug!("Ignoring invalid sending IP '{}' on device {}", ip, raw.id);
                    None
                }
            })
            .collect();
        let customs = raw
            .customs
            .into_iter()
            .map(|c| (Ustr::from(c.name.as_str()), c.id))
            .collect();
        Device {
            id: raw.id,
            name: raw.name,
            company_id: raw.company_id,
            max_flow_rate: raw.max_flow_rate,
            sample_rate: raw.sample_rate,
            sending_ips,
            interfaces: raw.interfaces,
            customs,
        }
    }
}

#[derive(Deserialize)]
struct DeviceWrapper {
    device: ApiDevice,
}

#[derive(Deserialize)]
struct DevicesWrapper {
    devices: Vec<ApiDevice>,
}

/// The API returns ids both as JSON numbers and as strings.
fn number_or_string<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Source of device metadata.
#[async_trait]
pub trait DeviceLookup: Send + Sync {
    async fn get_device_by_id(&self, id: u32) -> Result<Device, Error>;
    async fn get_device_by_ip(&self, ip: IpAddr) -> Result<Device, Error>;
    async fn get_device_by_if(&self, name: &str) -> Result<Device, Error>;
}

/// [`DeviceLookup`] backed by the collector's device API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        email: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            headers: auth_headers(email, token)?,
            timeout,
        })
    }

    /// Client with its own connection pool, for use outside a sender.
    pub fn standalone(
        base_url: &str,
        email: &str,
        token: &str,
        proxy: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        Self::new(get_client(proxy, timeout), base_url, email, token, timeout)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, Error> {
        let url = format!("{}/{}", self.base_url, path);
        debug!("Device API request: GET {url}");
        let resp = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .headers(self.headers.clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::from_api_status(status, &body));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, Error> {
        let body = self.get("devices").await?;
        let wrapper: DevicesWrapper = serde_json::from_slice(&body)
            .map_err(|e| Error::Api(format!("invalid devices response: {e}")))?;
        Ok(wrapper.devices.into_iter().map(Device::from).collect())
    }
}

#[async_trait]
impl DeviceLookup for ApiClient {
    async fn get_device_by_id(&self, id: u32) -> Result<Device, Error> {
        let body = self.get(&format!("device/{id}")).await?;
        let wrapper: DeviceWrapper = serde_json::from_slice(&body)
            .map_err(|e| Error::Api(format!("invalid device response: {e}")))?;
        Ok(wrapper.device.into())
    }

    async fn get_device_by_ip(&self, ip: IpAddr) -> Result<Device, Error> {
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.sends_from(ip))
            .ok_or(Error::DeviceNotFound)
    }

    async fn get_device_by_if(&self, name: &str) -> Result<Device, Error> {
        self.list_devices()
            .await?
            .into_iter()
            .find(|d| d.has_interface(name))
            .ok_or(Error::DeviceNotFound)
    }
}
