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

use std::io;

use thiserror::Error;

use crate::transports::TransportError;

/// Failures of the hello exchange and the identity checks around it.
#[derive(Debug, Error)]
pub enum HelloError {
    #[error("Peer presented {0} certificates, expected exactly 1")]
    InvalidCertificateCount(usize),
    #[error("Peer presented our own device ID")]
    ConnectedToSelf,
    #[error("Connected to device '{actual}' but expected '{expected}'")]
    UnexpectedDevice { expected: String, actual: String },
    #[error("Certificate common name '{actual}' does not match expected '{expected}'")]
    CommonNameMismatch { expected: String, actual: String },
    #[error("Hello exchange timed out")]
    Timeout,
    #[error("Remote client version '{0}' is not compatible")]
    IncompatibleVersion(String),
    #[error("Hello frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),
    #[error("Malformed hello frame")]
    Malformed,
    #[error("Connection closed before hello completed")]
    ClosedBeforeHello,
    #[error("IO error during hello: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ConnectionManagerError {
    #[error("Device is ignored by configuration")]
    DeviceIgnored,
    #[error("Device is paused")]
    DevicePaused,
    #[error("Device is not configured")]
    UnknownDevice,
    #[error("Connection limit reached")]
    ConnectionLimitReached,
    #[error("Remote address is not in the device's allowed networks")]
    NetworkNotAllowed,
    #[error("Already connected and priority {new_priority} is not an upgrade over {worst}")]
    NotAnUpgrade { new_priority: i32, worst: i32 },
    #[error("Rejected by the protocol layer: {0}")]
    ProtocolVeto(#[source] anyhow::Error),
    #[error("Hello failed: {0}")]
    Hello(#[from] HelloError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
