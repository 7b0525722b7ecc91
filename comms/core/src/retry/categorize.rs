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

use std::{error::Error, fmt, io};

use crate::connection_manager::HelloError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Unknown,
    ConnectionReset,
    Timeout,
    ConnectionRefused,
    NetworkUnreachable,
    NetworkDown,
    HostUnreachable,
    Temporary,
    Authentication,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCategory::Unknown => "unknown",
            ErrorCategory::ConnectionReset => "connection_reset",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ConnectionRefused => "connection_refused",
            ErrorCategory::NetworkUnreachable => "network_unreachable",
            ErrorCategory::NetworkDown => "network_down",
            ErrorCategory::HostUnreachable => "host_unreachable",
            ErrorCategory::Temporary => "temporary",
            ErrorCategory::Authentication => "authentication",
        };
        f.write_str(s)
    }
}

/// Classify an error chain into a retry category. Walks `source()` so that
/// arbitrarily wrapped errors categorize the same as their cause.
pub fn categorize_error(err: &(dyn Error + 'static)) -> ErrorCategory {
    let mut current: Option<&(dyn Error + 'static)> = Some(err);
    while let Some(err) = current {
        if let Some(category) = categorize_single(err) {
            return category;
        }
        current = err.source();
    }
    ErrorCategory::Unknown
}

fn categorize_single(err: &(dyn Error + 'static)) -> Option<ErrorCategory> {
    if let Some(hello) = err.downcast_ref::<HelloError>() {
        return match hello {
            HelloError::CommonNameMismatch { .. } |
            HelloError::ConnectedToSelf |
            HelloError::UnexpectedDevice { .. } |
            HelloError::InvalidCertificateCount(_) => Some(ErrorCategory::Authentication),
            HelloError::Timeout => Some(ErrorCategory::Timeout),
            _ => None,
        };
    }

    let io_err = err.downcast_ref::<io::Error>()?;
    match io_err.kind() {
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe => {
            Some(ErrorCategory::ConnectionReset)
        },
        io::ErrorKind::TimedOut => Some(ErrorCategory::Timeout),
        io::ErrorKind::ConnectionRefused => Some(ErrorCategory::ConnectionRefused),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Some(ErrorCategory::Temporary),
        // Errno values are spelled differently per platform; defer to the
        // platform hook as a last resort
        _ => io_err.raw_os_error().and_then(categorize_raw_os_error),
    }
}

#[cfg(target_os = "linux")]
fn categorize_raw_os_error(code: i32) -> Option<ErrorCategory> {
    match code {
        100 => Some(ErrorCategory::NetworkDown),        // ENETDOWN
        101 => Some(ErrorCategory::NetworkUnreachable), // ENETUNREACH
        104 => Some(ErrorCategory::ConnectionReset),    // ECONNRESET
        110 => Some(ErrorCategory::Timeout),            // ETIMEDOUT
        111 => Some(ErrorCategory::ConnectionRefused),  // ECONNREFUSED
        113 => Some(ErrorCategory::HostUnreachable),    // EHOSTUNREACH
        _ => None,
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd", target_os = "openbsd", target_os = "netbsd"))]
fn categorize_raw_os_error(code: i32) -> Option<ErrorCategory> {
    match code {
        50 => Some(ErrorCategory::NetworkDown),        // ENETDOWN
        51 => Some(ErrorCategory::NetworkUnreachable), // ENETUNREACH
        54 => Some(ErrorCategory::ConnectionReset),    // ECONNRESET
        60 => Some(ErrorCategory::Timeout),            // ETIMEDOUT
        61 => Some(ErrorCategory::ConnectionRefused),  // ECONNREFUSED
        65 => Some(ErrorCategory::HostUnreachable),    // EHOSTUNREACH
        _ => None,
    }
}

#[cfg(windows)]
fn categorize_raw_os_error(code: i32) -> Option<ErrorCategory> {
    match code {
        10050 => Some(ErrorCategory::NetworkDown),        // WSAENETDOWN
        10051 => Some(ErrorCategory::NetworkUnreachable), // WSAENETUNREACH
        10054 => Some(ErrorCategory::ConnectionReset),    // WSAECONNRESET
        10060 => Some(ErrorCategory::Timeout),            // WSAETIMEDOUT
        10061 => Some(ErrorCategory::ConnectionRefused),  // WSAECONNREFUSED
        10065 => Some(ErrorCategory::HostUnreachable),    // WSAEHOSTUNREACH
        _ => None,
    }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    windows
)))]
fn categorize_raw_os_error(_: i32) -> Option<ErrorCategory> {
    None
}

#[cfg(test)]
mod tests {
    use thiserror::Error;

    use super::*;

    #[derive(Debug, Error)]
    #[error("wrapped: {source}")]
    struct Wrapper {
        #[source]
        source: Box<dyn Error + Send + Sync>,
    }

    fn wrap(err: impl Error + Send + Sync + 'static) -> Wrapper {
        Wrapper { source: Box::new(err) }
    }

    #[test]
    fn plain_kinds_categorize() {
        let cases = [
            (io::ErrorKind::ConnectionReset, ErrorCategory::ConnectionReset),
            (io::ErrorKind::TimedOut, ErrorCategory::Timeout),
            (io::ErrorKind::ConnectionRefused, ErrorCategory::ConnectionRefused),
            (io::ErrorKind::WouldBlock, ErrorCategory::Temporary),
        ];
        for (kind, expected) in cases {
            let err = io::Error::from(kind);
            assert_eq!(categorize_error(&err), expected, "kind {:?}", kind);
        }
    }

    #[test]
    fn unrecognized_error_is_unknown() {
        let err = io::Error::new(io::ErrorKind::Other, "mystery");
        assert_eq!(categorize_error(&err), ErrorCategory::Unknown);
    }

    #[test]
    fn wrapping_does_not_change_the_category() {
        let inner = io::Error::from(io::ErrorKind::ConnectionRefused);
        let expected = categorize_error(&inner);
        let double_wrapped = wrap(wrap(inner));
        assert_eq!(categorize_error(&double_wrapped), expected);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn errno_values_categorize() {
        let cases = [
            (101, ErrorCategory::NetworkUnreachable),
            (100, ErrorCategory::NetworkDown),
            (113, ErrorCategory::HostUnreachable),
        ];
        for (errno, expected) in cases {
            let err = io::Error::from_raw_os_error(errno);
            assert_eq!(categorize_error(&err), expected, "errno {}", errno);
        }
    }

    #[test]
    fn hello_authentication_errors_categorize() {
        let err = HelloError::CommonNameMismatch {
            expected: "driftsync".to_string(),
            actual: "mallory".to_string(),
        };
        assert_eq!(categorize_error(&err), ErrorCategory::Authentication);
        assert_eq!(categorize_error(&wrap(err)), ErrorCategory::Authentication);
    }
}
