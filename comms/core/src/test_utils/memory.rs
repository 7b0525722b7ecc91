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

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    net::TcpStream,
};

use crate::collaborators::{SecureStream, TlsHandshaker};

/// A duplex stream masquerading as a completed TLS session, with injected
/// peer certificate bytes and common name.
pub struct TestSecureStream<S> {
    inner: S,
    peer_certificates: Vec<Vec<u8>>,
    peer_common_name: Option<String>,
}

impl<S> TestSecureStream<S> {
    pub fn new(inner: S, peer_certificates: Vec<Vec<u8>>, peer_common_name: Option<String>) -> Self {
        Self {
            inner,
            peer_certificates,
            peer_common_name,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Sync + Unpin> SecureStream for TestSecureStream<S> {
    fn peer_certificates(&self) -> Vec<Vec<u8>> {
        self.peer_certificates.clone()
    }

    fn peer_common_name(&self) -> Option<String> {
        self.peer_common_name.clone()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TestSecureStream<S> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TestSecureStream<S> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A connected pair of secure streams: the first sees `cert_b`/`name_b` as
/// its peer, the second sees `cert_a`/`name_a`.
pub fn secure_stream_pair(
    cert_a: Vec<u8>,
    name_a: &str,
    cert_b: Vec<u8>,
    name_b: &str,
) -> (Box<dyn SecureStream>, Box<dyn SecureStream>) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    (
        Box::new(TestSecureStream::new(a, vec![cert_b], Some(name_b.to_string()))),
        Box::new(TestSecureStream::new(b, vec![cert_a], Some(name_a.to_string()))),
    )
}

/// A handshaker that performs no cryptography: every stream it touches
/// reports the configured peer certificate and common name. Lets tests run
/// real TCP dial/accept paths without a TLS stack.
pub struct TestTlsHandshaker {
    peer_certificate: Vec<u8>,
    peer_common_name: String,
}

impl TestTlsHandshaker {
    pub fn new(peer_certificate: Vec<u8>, peer_common_name: impl Into<String>) -> Self {
        Self {
            peer_certificate,
            peer_common_name: peer_common_name.into(),
        }
    }
}

#[async_trait]
impl TlsHandshaker for TestTlsHandshaker {
    async fn connect(&self, _server_name: &str, stream: TcpStream) -> io::Result<Box<dyn SecureStream>> {
        Ok(Box::new(TestSecureStream::new(
            stream,
            vec![self.peer_certificate.clone()],
            Some(self.peer_common_name.clone()),
        )))
    }

    async fn accept(&self, stream: TcpStream) -> io::Result<Box<dyn SecureStream>> {
        Ok(Box::new(TestSecureStream::new(
            stream,
            vec![self.peer_certificate.clone()],
            Some(self.peer_common_name.clone()),
        )))
    }
}

/// Secure stream backed by an in-memory duplex, for building connections
/// without any sockets.
pub fn duplex_secure_stream(peer_certificate: Vec<u8>, peer_common_name: &str) -> (Box<dyn SecureStream>, DuplexStream) {
    let (near, far) = tokio::io::duplex(64 * 1024);
    (
        Box::new(TestSecureStream::new(
            near,
            vec![peer_certificate],
            Some(peer_common_name.to_string()),
        )),
        far,
    )
}
