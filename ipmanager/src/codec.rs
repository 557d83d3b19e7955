// Copyright 2025 Anapaya Systems
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//! Request and result annotations.
//!
//! A requester asks for addresses by writing a JSON list of [NetworkRequest]s to
//! the request annotation. The manager answers by writing a JSON object mapping
//! each network name to the assigned address to the result annotation. Both
//! annotation keys share a configurable prefix:
//!
//! ```text
//! <prefix>/networks  [{"network":"ctlplane","subnetName":"subnet1","fixedIP":"10.0.0.10"}]
//! <prefix>/ipsets    {"ctlplane":{"ip":"10.0.0.10","vip":false,"gateway":"10.0.0.1"}}
//! ```

use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
};

use address_manager::{manager::dto::ReservationDto, pool::Assignment};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Default annotation prefix.
pub const DEFAULT_ANNOTATION_PREFIX: &str = "openstack-k8s-operators.org";

const REQUEST_SUFFIX: &str = "networks";
const RESULT_SUFFIX: &str = "ipsets";

/// Assignments by network name.
pub type Results = BTreeMap<String, Assignment>;

/// Codec errors.
#[derive(Debug, Error)]
pub enum CodecError {
    /// An annotation could not be decoded.
    #[error("malformed annotation {annotation}: {reason}")]
    Malformed { annotation: String, reason: String },
    /// The same network is requested more than once.
    #[error("network {0} requested more than once")]
    DuplicateNetwork(String),
    #[error("failed to encode annotation: {0}")]
    Encode(#[from] serde_json::Error),
}

/// An address request for one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    /// Network name.
    #[serde(alias = "name")]
    pub network: String,
    pub subnet_name: String,
    /// Specific address to reserve. An empty string means none.
    #[serde(
        rename = "fixedIP",
        default,
        deserialize_with = "empty_as_none",
        skip_serializing_if = "Option::is_none"
    )]
    pub fixed_ip: Option<Ipv4Addr>,
    /// Reserve a floating address that does not take the pool's gateway and routes.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub vip: bool,
}

impl NetworkRequest {
    /// Request for any free address of `network`/`subnet`.
    pub fn new(network: impl Into<String>, subnet: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            subnet_name: subnet.into(),
            fixed_ip: None,
            vip: false,
        }
    }

    pub fn with_fixed_ip(mut self, address: Ipv4Addr) -> Self {
        self.fixed_ip = Some(address);
        self
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> Result<Option<Ipv4Addr>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)?.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Reads and writes the request and result annotations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotationCodec {
    request_key: String,
    result_key: String,
}

impl Default for AnnotationCodec {
    fn default() -> Self {
        Self::new(DEFAULT_ANNOTATION_PREFIX)
    }
}

impl AnnotationCodec {
    /// Creates a codec using `<prefix>/networks` and `<prefix>/ipsets`.
    pub fn new(prefix: &str) -> Self {
        Self {
            request_key: format!("{prefix}/{REQUEST_SUFFIX}"),
            result_key: format!("{prefix}/{RESULT_SUFFIX}"),
        }
    }

    pub fn request_key(&self) -> &str {
        &self.request_key
    }

    pub fn result_key(&self) -> &str {
        &self.result_key
    }

    /// Decodes the requests. A missing or blank annotation means no requests.
    pub fn decode_requests(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Vec<NetworkRequest>, CodecError> {
        let Some(raw) = non_blank(annotations, &self.request_key) else {
            return Ok(Vec::new());
        };
        let requests: Vec<NetworkRequest> =
            serde_json::from_str(raw).map_err(|e| self.malformed(&self.request_key, e))?;

        let mut seen = BTreeSet::new();
        for request in &requests {
            if !seen.insert(request.network.as_str()) {
                return Err(CodecError::DuplicateNetwork(request.network.clone()));
            }
        }
        Ok(requests)
    }

    /// Decodes the results. A missing or blank annotation means no results.
    pub fn decode_results(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Results, CodecError> {
        let Some(raw) = non_blank(annotations, &self.result_key) else {
            return Ok(Results::new());
        };
        let dtos: BTreeMap<String, ReservationDto> =
            serde_json::from_str(raw).map_err(|e| self.malformed(&self.result_key, e))?;

        dtos.into_iter()
            .map(|(network, dto)| {
                let assignment = Assignment::try_from(dto)
                    .map_err(|e| self.malformed(&self.result_key, format!("{network}: {e:#}")))?;
                Ok((network, assignment))
            })
            .collect()
    }

    /// Encodes the results annotation value.
    pub fn encode_results(&self, results: &Results) -> Result<String, CodecError> {
        let dtos: BTreeMap<&str, ReservationDto> = results
            .iter()
            .map(|(network, assignment)| (network.as_str(), assignment.into()))
            .collect();
        Ok(serde_json::to_string(&dtos)?)
    }

    /// Encodes the request annotation value.
    pub fn encode_requests(&self, requests: &[NetworkRequest]) -> Result<String, CodecError> {
        Ok(serde_json::to_string(requests)?)
    }

    fn malformed(&self, annotation: &str, reason: impl ToString) -> CodecError {
        CodecError::Malformed {
            annotation: annotation.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn non_blank<'a>(annotations: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    annotations
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
}
