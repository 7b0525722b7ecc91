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

use std::{fmt, str::FromStr};

use blake2::Blake2b;
use data_encoding::{BASE32HEX_NOPAD, BASE32_NOPAD};
use digest::{consts::U32, Digest};
use rand::RngCore;
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// The length, in bytes, of a device identifier.
pub const DEVICE_ID_LEN: usize = 32;

type Blake2b256 = Blake2b<U32>;

#[derive(Debug, Error)]
pub enum DeviceIdError {
    #[error("Invalid device ID length")]
    InvalidLength,
    #[error("Invalid device ID encoding")]
    InvalidEncoding,
}

/// A 256-bit identifier for a remote device, derived from the device's
/// certificate bytes. Compared by value; the ordering is only meaningful for
/// canonical display.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    /// Derive the identifier from the peer's (DER-encoded) certificate bytes.
    pub fn from_certificate(cert_der: &[u8]) -> Self {
        let digest = Blake2b256::digest(cert_der);
        let mut buf = [0u8; DEVICE_ID_LEN];
        buf.copy_from_slice(&digest);
        Self(buf)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A short display form for logs.
    pub fn short_str(&self) -> String {
        self.to_string().chars().take(7).collect()
    }
}

impl TryFrom<&[u8]> for DeviceId {
    type Error = DeviceIdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != DEVICE_ID_LEN {
            return Err(DeviceIdError::InvalidLength);
        }
        let mut buf = [0u8; DEVICE_ID_LEN];
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE32_NOPAD
            .decode(s.to_ascii_uppercase().as_bytes())
            .map_err(|_| DeviceIdError::InvalidEncoding)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", BASE32_NOPAD.encode(&self.0))
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.short_str())
    }
}

/// Opaque identifier for a live connection.
///
/// 26 ASCII base-32-hex characters: the first 13 encode the 8-byte big-endian
/// sum of both hello timestamps, the last 13 encode 8 random bytes. Sorting by
/// the first 13 characters orders identifiers chronologically.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Generate an identifier from both sides' hello timestamps (nanoseconds
    /// since epoch) and the given randomness source.
    pub fn generate<R: RngCore + ?Sized>(local_timestamp: i64, remote_timestamp: i64, rng: &mut R) -> Self {
        let sum = (local_timestamp as u64).wrapping_add(remote_timestamp as u64);
        let mut id = BASE32HEX_NOPAD.encode(&sum.to_be_bytes());
        let mut random = [0u8; 8];
        rng.fill_bytes(&mut random);
        id.push_str(&BASE32HEX_NOPAD.encode(&random));
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The chronologically ordered prefix.
    pub fn time_prefix(&self) -> &str {
        &self.0[..13]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

/// The first application-level message exchanged after the TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub client_name: String,
    pub client_version: String,
    /// Only sent when the local side already knows the remote device.
    pub device_name: String,
    /// Nanoseconds since the epoch.
    pub timestamp: i64,
    /// How many parallel connections the remote will tolerate.
    pub num_connections: u32,
}

/// Why a connection was closed. A closed connection never re-opens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Evicted in favour of a better connection.
    Replaced,
    PeerClosed,
    Error,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Replaced => write!(f, "replaced"),
            CloseReason::PeerClosed => write!(f, "peer-closed"),
            CloseReason::Error => write!(f, "error"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Inbound => write!(f, "inbound"),
            ConnectionDirection::Outbound => write!(f, "outbound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;

    #[test]
    fn device_id_display_round_trip() {
        let id = DeviceId::from_certificate(b"some certificate bytes");
        let displayed = id.to_string();
        assert_eq!(displayed.parse::<DeviceId>().unwrap(), id);
    }

    #[test]
    fn connection_id_is_26_base32hex_chars() {
        let mut rng = StdRng::seed_from_u64(42);
        let id = ConnectionId::generate(1_000_000, 2_000_000, &mut rng);
        assert_eq!(id.as_str().len(), 26);
        assert!(id
            .as_str()
            .chars()
            .all(|c| c.is_ascii_digit() || ('A'..='V').contains(&c)));
    }

    #[test]
    fn connection_id_time_prefix_sorts_by_timestamp_sum() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut ids: Vec<(u64, ConnectionId)> = (0..1000)
            .map(|_| {
                let t0: i64 = rng.gen_range(0..i64::MAX / 2);
                let t1: i64 = rng.gen_range(0..i64::MAX / 2);
                ((t0 as u64).wrapping_add(t1 as u64), ConnectionId::generate(t0, t1, &mut rng))
            })
            .collect();
        ids.sort_by(|a, b| a.1.time_prefix().cmp(b.1.time_prefix()));
        let sums: Vec<u64> = ids.iter().map(|(sum, _)| *sum).collect();
        let mut sorted = sums.clone();
        sorted.sort_unstable();
        assert_eq!(sums, sorted);
    }

    #[test]
    fn connection_id_uniqueness_over_one_second_window() {
        use std::collections::HashSet;

        let mut rng = StdRng::seed_from_u64(7);
        let base = 1_700_000_000_000_000_000i64;
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let t0 = base + rng.gen_range(0..1_000_000_000);
            let t1 = base + rng.gen_range(0..1_000_000_000);
            let id = ConnectionId::generate(t0, t1, &mut rng);
            assert!(seen.insert(id), "duplicate connection id generated");
        }
    }
}
