// This file is part of ZENITH.
//
// Copyright (C) 2023 Affidaty Spa.
//
// ZENITH is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// ZENITH is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with ZENITH. If not, see <https://www.gnu.org/licenses/>.

//! Library error codes and results.

use std::fmt::{Display, Formatter};

/// Project-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Max string length when the error is converted to string using `to_string_full`.
const MAX_ERROR_SOURCE_STRING_LENGTH: usize = 128;

/// Error kind to better contextualize the returned error.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorKind {
    /// Auction height is below the chain's latest height.
    AuctionTooOld,
    /// Auction height is beyond the allowed window over the latest height.
    AuctionTooNew,
    /// The predicted proposer for the height has not registered.
    AuctionUnavailable,
    /// The auction has already been claimed by a build request.
    AuctionFinished,
    InvalidRequest,
    BadSignature,
    /// Public key material that cannot be parsed or is unsupported.
    InvalidKey,
    /// A transaction message carries no payment relevant to the auction.
    /// Never escapes a request, callers skip the message instead.
    NoPayment,
    NotFound,
    /// Store serialization failure, the transaction may be retried.
    Conflict,
    Cancelled,
    NetworkFault,
    StoreFault,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        use ErrorKind::*;
        let kind_str = match self {
            AuctionTooOld => "auction too far in the past",
            AuctionTooNew => "auction too far in the future",
            AuctionUnavailable => "auction unavailable",
            AuctionFinished => "auction already finished",
            InvalidRequest => "invalid request",
            BadSignature => "bad signature",
            InvalidKey => "invalid key",
            NoPayment => "no payment",
            NotFound => "not found",
            Conflict => "store conflict",
            Cancelled => "cancelled",
            NetworkFault => "network fault",
            StoreFault => "store fault",
            Internal => "internal error",
        };
        write!(f, "{}", kind_str)
    }
}

/// Project-wide error type.
/// Contains a kind enumerate and a `source` to identify the subsystem that may
/// have propagated the error.
#[derive(Debug)]
pub struct Error {
    /// Error kind.
    pub kind: ErrorKind,
    /// Optional lower-level cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Error {
            kind: self.kind,
            source: self.source.as_ref().map(|s| s.to_string().into()),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl<T> From<ErrorKind> for Result<T> {
    fn from(kind: ErrorKind) -> Self {
        Err(kind.into())
    }
}

impl Error {
    pub fn new(kind: ErrorKind) -> Error {
        Error { kind, source: None }
    }

    pub fn new_ext<E>(kind: ErrorKind, error: E) -> Error
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error {
            kind,
            source: Some(error.into()),
        }
    }

    pub fn to_string_full(&self) -> String {
        let mut err_string = self.to_string();
        if let Some(ref source) = self.source {
            let detail = format!(": {}", source);
            let max_len = std::cmp::min(detail.len(), MAX_ERROR_SOURCE_STRING_LENGTH);
            err_string.push_str(&detail[..max_len]);
        }
        err_string
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (&self.source, &other.source) {
            (None, None) => true,
            (Some(a), Some(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.source {
            None => None,
            Some(ref source) => Some(source.as_ref()),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use ErrorKind::*;

    #[test]
    fn generic_error_type() {
        let src1 = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");
        let src2 = io::Error::new(io::ErrorKind::TimedOut, "oh dear!");
        let err1 = Error::new_ext(StoreFault, src1);
        let err2 = Error::new_ext(StoreFault, src2);

        assert_ne!(err1, err2);
    }

    #[test]
    fn external_store_failure() {
        let source = io::Error::new(io::ErrorKind::PermissionDenied, "oh no!");

        let error = Error::new_ext(StoreFault, source);

        assert_eq!(error.to_string(), "store fault");
        assert_eq!(error.to_string_full(), "store fault: oh no!");
        let source = std::error::Error::source(&error)
            .unwrap()
            .downcast_ref::<io::Error>()
            .unwrap();
        assert_eq!(source.kind(), io::ErrorKind::PermissionDenied);
        assert!(std::error::Error::source(&source).is_none());
    }

    #[test]
    fn clone_preserves_kind_and_message() {
        let error = Error::new_ext(AuctionFinished, "claimed at height 42");
        let clone = error.clone();

        assert_eq!(error, clone);
        assert_eq!(clone.to_string_full(), "auction already finished: claimed at height 42");
    }
}
