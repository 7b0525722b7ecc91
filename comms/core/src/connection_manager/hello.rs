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

//! The bidirectional hello performed after the TLS handshake. The framing
//! here is the crate's default; embedders with their own wire protocol can
//! exchange hellos themselves and admit connections with the result.

use std::{io, time::Duration};

use bytes::{Buf, BufMut, BytesMut};
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use super::error::HelloError;
use crate::{
    collaborators::SecureStream,
    types::{DeviceId, Hello},
};

/// Deadline for the entire bidirectional exchange.
pub const HELLO_TIMEOUT: Duration = Duration::from_secs(20);

const MAX_HELLO_FRAME: usize = 1024;

/// Length-delimited hello framing: a u32 length prefix followed by
/// length-prefixed strings, the nanosecond timestamp, and the advertised
/// parallel-connection count.
#[derive(Debug, Default)]
pub struct HelloCodec;

impl Encoder<Hello> for HelloCodec {
    type Error = HelloError;

    fn encode(&mut self, hello: Hello, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = 2 + hello.client_name.len() +
            2 + hello.client_version.len() +
            2 + hello.device_name.len() +
            8 +
            4;
        if payload_len > MAX_HELLO_FRAME {
            return Err(HelloError::FrameTooLarge(payload_len));
        }
        dst.reserve(4 + payload_len);
        dst.put_u32(payload_len as u32);
        put_string(dst, &hello.client_name)?;
        put_string(dst, &hello.client_version)?;
        put_string(dst, &hello.device_name)?;
        dst.put_i64(hello.timestamp);
        dst.put_u32(hello.num_connections);
        Ok(())
    }
}

impl Decoder for HelloCodec {
    type Error = HelloError;
    type Item = Hello;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if payload_len > MAX_HELLO_FRAME {
            return Err(HelloError::FrameTooLarge(payload_len));
        }
        if src.len() < 4 + payload_len {
            src.reserve(4 + payload_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(payload_len);

        let client_name = get_string(&mut frame)?;
        let client_version = get_string(&mut frame)?;
        let device_name = get_string(&mut frame)?;
        if frame.remaining() < 12 {
            return Err(HelloError::Malformed);
        }
        let timestamp = frame.get_i64();
        let num_connections = frame.get_u32();

        Ok(Some(Hello {
            client_name,
            client_version,
            device_name,
            timestamp,
            num_connections,
        }))
    }
}

fn put_string(dst: &mut BytesMut, s: &str) -> Result<(), HelloError> {
    if s.len() > u16::MAX as usize {
        return Err(HelloError::FrameTooLarge(s.len()));
    }
    dst.put_u16(s.len() as u16);
    dst.put_slice(s.as_bytes());
    Ok(())
}

fn get_string(src: &mut BytesMut) -> Result<String, HelloError> {
    if src.remaining() < 2 {
        return Err(HelloError::Malformed);
    }
    let len = src.get_u16() as usize;
    if src.remaining() < len {
        return Err(HelloError::Malformed);
    }
    let bytes = src.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| HelloError::Malformed)
}

/// The current time as nanoseconds since the epoch, as carried in a hello.
pub fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX)
}

/// Perform the bidirectional hello under the 20s deadline: write ours, read
/// theirs. Reads are exact-length so no bytes beyond the hello are consumed
/// from the stream.
pub async fn exchange_hello<S>(stream: &mut S, local: Hello) -> Result<Hello, HelloError>
where S: AsyncRead + AsyncWrite + Unpin + Send {
    tokio::time::timeout(HELLO_TIMEOUT, async move {
        let mut codec = HelloCodec;
        let mut out = BytesMut::new();
        codec.encode(local, &mut out)?;
        stream.write_all(&out).await?;
        stream.flush().await?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(eof_means_closed)?;
        let payload_len = u32::from_be_bytes(len_buf) as usize;
        if payload_len > MAX_HELLO_FRAME {
            return Err(HelloError::FrameTooLarge(payload_len));
        }
        let mut payload = vec![0u8; payload_len];
        stream.read_exact(&mut payload).await.map_err(eof_means_closed)?;

        let mut buf = BytesMut::with_capacity(4 + payload_len);
        buf.put_slice(&len_buf);
        buf.put_slice(&payload);
        codec.decode(&mut buf)?.ok_or(HelloError::Malformed)
    })
    .await
    .map_err(|_| HelloError::Timeout)?
}

fn eof_means_closed(err: io::Error) -> HelloError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        HelloError::ClosedBeforeHello
    } else {
        HelloError::Io(err)
    }
}

/// Require exactly one peer certificate and derive the remote device ID from
/// it, rejecting connections from ourselves.
pub fn verify_peer_identity(stream: &dyn SecureStream, local_device_id: &DeviceId) -> Result<DeviceId, HelloError> {
    let certs = stream.peer_certificates();
    if certs.len() != 1 {
        return Err(HelloError::InvalidCertificateCount(certs.len()));
    }
    let device_id = DeviceId::from_certificate(&certs[0]);
    if &device_id == local_device_id {
        return Err(HelloError::ConnectedToSelf);
    }
    Ok(device_id)
}

/// Hello-level version compatibility: the major version components must
/// match. Unparseable or empty versions are accepted, matching the lenient
/// posture toward older clients.
pub fn versions_compatible(local: &str, remote: &str) -> bool {
    let major = |v: &str| v.split('.').next().and_then(|m| m.parse::<u64>().ok());
    match (major(local), major(remote)) {
        (Some(local), Some(remote)) => local == remote,
        _ => true,
    }
}

/// Verify the certificate common name against the configured expectation or
/// the client default.
pub fn verify_common_name(stream: &dyn SecureStream, expected: &str) -> Result<(), HelloError> {
    let actual = stream.peer_common_name().unwrap_or_default();
    if actual != expected {
        return Err(HelloError::CommonNameMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello() -> Hello {
        Hello {
            client_name: "driftsync".to_string(),
            client_version: "0.3.1".to_string(),
            device_name: "workstation".to_string(),
            timestamp: 1_700_000_000_123_456_789,
            num_connections: 4,
        }
    }

    #[test]
    fn codec_round_trip() {
        let mut codec = HelloCodec;
        let mut buf = BytesMut::new();
        codec.encode(hello(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, hello());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut codec = HelloCodec;
        let mut buf = BytesMut::new();
        codec.encode(hello(), &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[7..]);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), hello());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = HelloCodec;
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);
        buf.put_slice(&[0u8; 64]);
        match codec.decode(&mut buf) {
            Err(HelloError::FrameTooLarge(len)) => assert_eq!(len, 1_000_000),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let mut codec = HelloCodec;
        let mut buf = BytesMut::new();
        // Payload claims a 100-byte string but carries only 2
        buf.put_u32(4);
        buf.put_u16(100);
        buf.put_slice(b"ab");
        match codec.decode(&mut buf) {
            Err(HelloError::Malformed) => {},
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn exchange_over_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let ours = hello();
        let theirs = Hello {
            device_name: "laptop".to_string(),
            num_connections: 2,
            ..hello()
        };

        let theirs_clone = theirs.clone();
        let remote = tokio::spawn(async move { exchange_hello(&mut b, theirs_clone).await.unwrap() });
        let received = exchange_hello(&mut a, ours.clone()).await.unwrap();

        assert_eq!(received, theirs);
        assert_eq!(remote.await.unwrap(), ours);
    }

    #[test]
    fn version_compatibility_is_major_only() {
        assert!(versions_compatible("0.3.1", "0.9.9"));
        assert!(!versions_compatible("0.3.1", "1.0.0"));
        assert!(versions_compatible("1.2.0", "1.0.7"));
        // Lenient toward clients that do not send a parseable version
        assert!(versions_compatible("0.3.1", ""));
        assert!(versions_compatible("0.3.1", "dev"));
    }

    #[tokio::test]
    async fn closed_stream_fails_exchange() {
        let (mut a, b) = tokio::io::duplex(4096);
        drop(b);
        let err = exchange_hello(&mut a, hello()).await.unwrap_err();
        // Either the write or the missing reply surfaces, depending on timing
        assert!(matches!(err, HelloError::ClosedBeforeHello | HelloError::Io(_)));
    }
}
