// Copyright 2025, The Driftsync Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::net::IpAddr;

use cidr::IpCidr;
use log::*;

use crate::config::Options;

const LOG_TARGET: &str = "comms::lan";

/// Decides whether an address is on the local network. Used at dial and
/// accept time to pick the LAN vs WAN priority for the same transport.
#[derive(Debug, Default)]
pub struct LanClassifier {
    always_local: Vec<IpCidr>,
    /// Networks bound on local interfaces, as supplied by the embedder.
    /// `None` means enumeration was unavailable and RFC-1918 privateness is
    /// used as the fallback.
    interface_nets: Option<Vec<IpCidr>>,
}

impl LanClassifier {
    pub fn new(options: &Options) -> Self {
        let mut always_local = Vec::with_capacity(options.always_local_nets.len());
        for net in &options.always_local_nets {
            match net.parse::<IpCidr>() {
                Ok(cidr) => always_local.push(cidr),
                Err(err) => {
                    warn!(target: LOG_TARGET, "Ignoring invalid alwaysLocalNet '{}': {}", net, err);
                },
            }
        }
        Self {
            always_local,
            interface_nets: None,
        }
    }

    /// Provide the networks bound on this host's interfaces. Interface
    /// enumeration is platform territory and belongs to the embedder.
    pub fn with_interface_nets(mut self, nets: Vec<IpCidr>) -> Self {
        self.interface_nets = Some(nets);
        self
    }

    pub fn is_lan(&self, addr: &IpAddr) -> bool {
        if addr.is_loopback() || is_link_local(addr) {
            return true;
        }
        if self.always_local.iter().any(|cidr| cidr.contains(addr)) {
            return true;
        }
        match &self.interface_nets {
            Some(nets) => nets.iter().any(|cidr| cidr.contains(addr)),
            None => is_rfc1918_private(addr),
        }
    }

    /// Classify a URL host. Non-IP hosts are assumed WAN; the core performs
    /// no name resolution.
    pub fn is_lan_host(&self, host: &str) -> bool {
        match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(addr) => self.is_lan(&addr),
            Err(_) => false,
        }
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

fn is_rfc1918_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private(),
        // Unique local addresses are the closest v6 analogue
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier(always_local: &[&str]) -> LanClassifier {
        LanClassifier::new(&Options {
            always_local_nets: always_local.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    #[test]
    fn loopback_and_link_local_are_lan() {
        let c = classifier(&[]);
        assert!(c.is_lan(&"127.0.0.1".parse().unwrap()));
        assert!(c.is_lan(&"::1".parse().unwrap()));
        assert!(c.is_lan(&"169.254.10.1".parse().unwrap()));
        assert!(c.is_lan(&"fe80::1".parse().unwrap()));
    }

    #[test]
    fn configured_cidr_is_lan() {
        let c = classifier(&["203.0.113.0/24"]);
        assert!(c.is_lan(&"203.0.113.7".parse().unwrap()));
        assert!(!c.is_lan(&"203.0.114.7".parse().unwrap()));
    }

    #[test]
    fn rfc1918_fallback_without_interface_nets() {
        let c = classifier(&[]);
        assert!(c.is_lan(&"192.168.1.10".parse().unwrap()));
        assert!(c.is_lan(&"10.44.0.3".parse().unwrap()));
        assert!(!c.is_lan(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn interface_nets_override_privateness() {
        let c = classifier(&[]).with_interface_nets(vec!["100.64.0.0/10".parse().unwrap()]);
        assert!(c.is_lan(&"100.64.0.9".parse().unwrap()));
        // With enumeration available, an unmatched private address is WAN
        assert!(!c.is_lan(&"192.168.1.10".parse().unwrap()));
    }

    #[test]
    fn invalid_cidr_is_ignored() {
        let c = classifier(&["not-a-cidr", "10.0.0.0/8"]);
        assert!(c.is_lan(&"10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn non_ip_host_is_wan() {
        let c = classifier(&[]);
        assert!(!c.is_lan_host("example.com"));
        assert!(c.is_lan_host("[::1]"));
        assert!(c.is_lan_host("192.168.0.4"));
    }
}
