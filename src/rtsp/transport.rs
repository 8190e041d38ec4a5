use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::error::{MediaError, ProtocolFault};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// RTP over UDP.
    Datagram,
    /// RTP interleaved on the RTSP TCP connection.
    Interleaved,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PortPair {
    pub rtp: u16,
    pub rtcp: u16,
}

impl PortPair {
    pub fn new(rtp: u16, rtcp: u16) -> Self {
        Self { rtp, rtcp }
    }

    /// `5000-5001`, or a lone `5000` meaning `5000-5001`.
    fn parse(value: &str) -> Option<Self> {
        match value.split_once('-') {
            Some((a, b)) => Some(Self::new(a.trim().parse().ok()?, b.trim().parse().ok()?)),
            None => {
                let rtp: u16 = value.trim().parse().ok()?;
                Some(Self::new(rtp, rtp.checked_add(1)?))
            }
        }
    }
}

impl Display for PortPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.rtp, self.rtcp)
    }
}

/// One comma-separated alternative of a client's `Transport` header.
#[derive(Clone, Debug, Default)]
struct TransportSpec {
    profile: String,
    multicast: bool,
    client_port: Option<PortPair>,
    interleaved: Option<(u8, u8)>,
}

impl TransportSpec {
    fn parse(text: &str) -> Self {
        let mut params = text.split(';').map(str::trim);
        let mut spec = TransportSpec {
            profile: params.next().unwrap_or_default().to_ascii_uppercase(),
            ..Default::default()
        };
        for param in params {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key.to_ascii_lowercase().as_str() {
                "multicast" => spec.multicast = true,
                "client_port" => spec.client_port = PortPair::parse(value),
                "interleaved" => {
                    spec.interleaved = PortPair::parse(value)
                        .and_then(|p| Some((u8::try_from(p.rtp).ok()?, u8::try_from(p.rtcp).ok()?)))
                }
                _ => {}
            }
        }
        spec
    }

    fn is_secure(&self) -> bool {
        self.profile
            .split('/')
            .any(|part| part == "SAVP" || part == "SAVPF")
    }

    fn delivery(&self) -> Option<Delivery> {
        match self.profile.as_str() {
            "RTP/AVP" | "RTP/AVP/UDP" => Some(Delivery::Datagram),
            "RTP/AVP/TCP" => Some(Delivery::Interleaved),
            _ => None,
        }
    }
}

/// Transport agreed for one track. Fixed once SETUP for that track succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransportDescriptor {
    pub track: u8,
    pub delivery: Delivery,
    /// There is no SRTP stack on the device; never true.
    pub secure_supported: bool,
    pub client_ports: Option<PortPair>,
    pub server_ports: Option<PortPair>,
    pub interleaved: Option<(u8, u8)>,
    pub uri: String,
}

impl TransportDescriptor {
    pub fn needs_ports(&self) -> bool {
        self.delivery == Delivery::Datagram
    }

    /// Value of the `Transport` header in the SETUP response.
    pub fn header_value(&self) -> String {
        match self.delivery {
            Delivery::Datagram => {
                let mut value = String::from("RTP/AVP;unicast");
                if let Some(client) = self.client_ports {
                    value.push_str(&format!(";client_port={}", client));
                }
                if let Some(server) = self.server_ports {
                    value.push_str(&format!(";server_port={}", server));
                }
                value
            }
            Delivery::Interleaved => {
                let (rtp, rtcp) = self.interleaved.unwrap_or((0, 1));
                format!("RTP/AVP/TCP;unicast;interleaved={}-{}", rtp, rtcp)
            }
        }
    }
}

fn unsupported(detail: impl Into<String>) -> MediaError {
    MediaError::protocol(ProtocolFault::UnsupportedTransport, detail)
}

fn parse_specs(header: &str) -> Vec<TransportSpec> {
    header
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(TransportSpec::parse)
        .collect()
}

fn refuse_secure(specs: &[TransportSpec]) -> Result<(), MediaError> {
    match specs.iter().find(|spec| spec.is_secure()) {
        Some(secure) => {
            log::warn!("transport: rejecting secure profile {}", secure.profile);
            Err(unsupported(format!("{} is not supported", secure.profile)))
        }
        None => Ok(()),
    }
}

/// Fails with 461 when any alternative in the header asks for SRTP. Runs
/// ahead of every other check on a SETUP.
pub fn reject_secure(header: &str) -> Result<(), MediaError> {
    refuse_secure(&parse_specs(header))
}

/// Pick the first usable alternative from a `Transport` header.
///
/// A secure profile anywhere in the header fails the whole request, before
/// any other alternative is considered.
pub fn negotiate(header: &str, track: u8, uri: &str) -> Result<TransportDescriptor, MediaError> {
    let specs = parse_specs(header);
    refuse_secure(&specs)?;

    for spec in &specs {
        if spec.multicast {
            log::debug!("transport: skipping multicast alternative {}", spec.profile);
            continue;
        }
        let descriptor = match spec.delivery() {
            Some(Delivery::Datagram) => match spec.client_port {
                Some(client) => TransportDescriptor {
                    track,
                    delivery: Delivery::Datagram,
                    secure_supported: false,
                    client_ports: Some(client),
                    server_ports: None,
                    interleaved: None,
                    uri: uri.to_string(),
                },
                None => continue,
            },
            Some(Delivery::Interleaved) => TransportDescriptor {
                track,
                delivery: Delivery::Interleaved,
                secure_supported: false,
                client_ports: None,
                server_ports: None,
                interleaved: Some(
                    spec.interleaved
                        .unwrap_or((track.saturating_mul(2), track.saturating_mul(2).saturating_add(1))),
                ),
                uri: uri.to_string(),
            },
            None => continue,
        };
        return Ok(descriptor);
    }

    Err(unsupported(format!("no usable alternative in {:?}", header)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_461(result: Result<TransportDescriptor, MediaError>) {
        match result {
            Err(err) => assert_eq!(err.fault(), Some(ProtocolFault::UnsupportedTransport)),
            Ok(descriptor) => panic!("expected 461, got {:?}", descriptor),
        }
    }

    #[test]
    fn test_reject_secure_only_looks_at_profiles() {
        assert!(reject_secure("RTP/AVP;unicast;client_port=5000-5001").is_ok());
        assert!(reject_secure("").is_ok());
        let err = reject_secure("RTP/AVP/TCP;unicast, RTP/SAVP;unicast").unwrap_err();
        assert_eq!(err.fault(), Some(ProtocolFault::UnsupportedTransport));
    }

    #[test]
    fn test_udp_unicast() {
        let d = negotiate("RTP/AVP;unicast;client_port=5000-5001", 0, "rtsp://cam/vs0/track0").unwrap();
        assert_eq!(d.delivery, Delivery::Datagram);
        assert_eq!(d.client_ports, Some(PortPair::new(5000, 5001)));
        assert!(!d.secure_supported);
        assert!(d.needs_ports());
    }

    #[test]
    fn test_tcp_interleaved_defaults_by_track() {
        let d = negotiate("RTP/AVP/TCP;unicast", 1, "u").unwrap();
        assert_eq!(d.delivery, Delivery::Interleaved);
        assert_eq!(d.interleaved, Some((2, 3)));
        assert_eq!(d.header_value(), "RTP/AVP/TCP;unicast;interleaved=2-3");

        let d = negotiate("RTP/AVP/TCP;unicast;interleaved=6-7", 0, "u").unwrap();
        assert_eq!(d.interleaved, Some((6, 7)));
        assert!(!d.needs_ports());
    }

    #[test]
    fn test_secure_profiles_always_rejected() {
        assert_461(negotiate("RTP/SAVP;unicast;client_port=5000-5001", 0, "u"));
        assert_461(negotiate("RTP/SAVPF;unicast;client_port=5000-5001", 0, "u"));
        assert_461(negotiate("RTP/SAVP/TCP;unicast;interleaved=0-1", 0, "u"));
        // an acceptable alternative does not rescue the request
        assert_461(negotiate(
            "RTP/AVP;unicast;client_port=5000-5001,RTP/SAVP;unicast;client_port=5002-5003",
            0,
            "u",
        ));
        assert_461(negotiate("rtp/savp;unicast", 0, "u"));
    }

    #[test]
    fn test_unusable_alternatives() {
        assert_461(negotiate("RTP/AVP;multicast", 0, "u"));
        assert_461(negotiate("RTP/AVP;unicast", 0, "u"));
        assert_461(negotiate("RAW/RAW/UDP;unicast;client_port=1-2", 0, "u"));
        assert_461(negotiate("", 0, "u"));
    }

    #[test]
    fn test_first_usable_alternative_wins() {
        let d = negotiate(
            "RTP/AVP;multicast,RTP/AVP/TCP;unicast;interleaved=0-1,RTP/AVP;unicast;client_port=7000-7001",
            0,
            "u",
        )
        .unwrap();
        assert_eq!(d.delivery, Delivery::Interleaved);
    }

    #[test]
    fn test_header_value_with_server_ports() {
        let mut d = negotiate("RTP/AVP/UDP;unicast;client_port=5000", 0, "u").unwrap();
        d.server_ports = Some(PortPair::new(50000, 50001));
        assert_eq!(
            d.header_value(),
            "RTP/AVP;unicast;client_port=5000-5001;server_port=50000-50001"
        );
    }
}
