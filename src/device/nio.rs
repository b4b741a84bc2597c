//! Network I/O endpoints
//!
//! A `NetworkEndpoint` is one end of a virtual wire attached to a device
//! port: either a UDP tunnel towards another emulated device or a host
//! TAP interface. Endpoints are immutable once constructed and owned by
//! the port binding that created them.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::caps::{check_privileged_access, CapabilityProbe};
use super::DeviceError;

/// One end of a virtual wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEndpoint {
    /// UDP tunnel towards a remote endpoint. The local port must already
    /// be allocated from the data pool by the caller; the socket itself
    /// is opened by the device process.
    UdpTunnel {
        lport: u16,
        rhost: String,
        rport: u16,
    },
    /// Host TAP interface
    Tap { device: String },
}

impl NetworkEndpoint {
    /// Create a UDP tunnel endpoint. Side-effect free.
    pub fn udp(lport: u16, rhost: impl Into<String>, rport: u16) -> Self {
        Self::UdpTunnel {
            lport,
            rhost: rhost.into(),
            rport,
        }
    }

    /// Create a TAP endpoint, gated by the privileged-access check on the
    /// device binary
    pub fn tap(
        device: impl Into<String>,
        binary: &Path,
        probe: &dyn CapabilityProbe,
    ) -> Result<Self, DeviceError> {
        let device = device.into();
        check_privileged_access(probe, binary, &device)?;
        Ok(Self::Tap { device })
    }
}

impl fmt::Display for NetworkEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UdpTunnel {
                lport,
                rhost,
                rport,
            } => write!(f, "udp tunnel {} -> {}:{}", lport, rhost, rport),
            Self::Tap { device } => write!(f, "tap {}", device),
        }
    }
}

/// Wire description of an endpoint, as carried in caller requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EndpointSpec {
    #[serde(rename = "nio_udp")]
    Udp {
        lport: u16,
        rhost: String,
        rport: u16,
    },
    #[serde(rename = "nio_tap")]
    Tap { tap_device: String },
}

impl EndpointSpec {
    /// Build the endpoint this spec describes
    pub fn build(
        &self,
        binary: &Path,
        probe: &dyn CapabilityProbe,
    ) -> Result<NetworkEndpoint, DeviceError> {
        match self {
            Self::Udp {
                lport,
                rhost,
                rport,
            } => Ok(NetworkEndpoint::udp(*lport, rhost.clone(), *rport)),
            Self::Tap { tap_device } => NetworkEndpoint::tap(tap_device.clone(), binary, probe),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::caps::stub::StubProbe;
    use std::path::PathBuf;

    #[test]
    fn test_udp_endpoint_is_side_effect_free() {
        let nio = NetworkEndpoint::udp(30001, "10.0.0.2", 30002);
        assert_eq!(
            nio,
            NetworkEndpoint::UdpTunnel {
                lport: 30001,
                rhost: "10.0.0.2".to_string(),
                rport: 30002,
            }
        );
    }

    #[test]
    fn test_tap_requires_privilege() {
        let binary = PathBuf::from("/usr/bin/vpcs");

        let denied = NetworkEndpoint::tap("tap0", &binary, &StubProbe::unprivileged(false));
        assert!(matches!(
            denied,
            Err(DeviceError::PermissionDenied { .. })
        ));

        let granted = NetworkEndpoint::tap("tap0", &binary, &StubProbe::unprivileged(true));
        assert_eq!(
            granted.unwrap(),
            NetworkEndpoint::Tap {
                device: "tap0".to_string()
            }
        );
    }

    #[test]
    fn test_spec_wire_format() {
        let spec: EndpointSpec =
            serde_json::from_str(r#"{"type":"nio_udp","lport":30001,"rhost":"127.0.0.1","rport":30002}"#)
                .unwrap();
        assert!(matches!(spec, EndpointSpec::Udp { lport: 30001, .. }));

        let spec: EndpointSpec =
            serde_json::from_str(r#"{"type":"nio_tap","tap_device":"tap0"}"#).unwrap();
        assert!(matches!(spec, EndpointSpec::Tap { .. }));
    }
}
