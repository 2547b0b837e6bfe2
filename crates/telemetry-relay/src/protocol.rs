// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Telemetry protocols accepted by the relay. Each one owns an independent store partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Syslog,
    NetflowFamily,
    SnmpTrap,
    Metric,
    RemoteEvent,
}

impl Protocol {
    pub const ALL: [Protocol; 5] = [
        Protocol::Syslog,
        Protocol::NetflowFamily,
        Protocol::SnmpTrap,
        Protocol::Metric,
        Protocol::RemoteEvent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Syslog => "syslog",
            Protocol::NetflowFamily => "netflow_family",
            Protocol::SnmpTrap => "snmp_trap",
            Protocol::Metric => "metric",
            Protocol::RemoteEvent => "remote_event",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown protocol '{0}'")]
pub struct UnknownProtocol(pub String);

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    /// Accepts the canonical snake_case tag plus the short aliases collectors commonly use.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "syslog" => Ok(Protocol::Syslog),
            "netflow_family" | "netflow" | "ipfix" | "sflow" => Ok(Protocol::NetflowFamily),
            "snmp_trap" | "snmp" | "trap" => Ok(Protocol::SnmpTrap),
            "metric" | "metrics" => Ok(Protocol::Metric),
            "remote_event" | "event" | "events" => Ok(Protocol::RemoteEvent),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}
