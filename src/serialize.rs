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

//! MessagePack serialization helpers.
//!
//! Used as the opaque transaction wire format of the reference test chain.
//! The encoding is positional (without field names), so re-encoding a decoded
//! value is a fixed point: this is what makes it suitable as the "normalized"
//! transaction form.

use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Serialize using MessagePack format (without field names).
///
/// # Error
///
/// If the data cannot be serialized an `InvalidRequest` error kind is returned.
pub fn rmp_serialize<T>(val: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    rmp_serde::to_vec(val).map_err(|err| Error::new_ext(ErrorKind::InvalidRequest, err))
}

/// Deserialize using MessagePack format.
///
/// # Error
///
/// If the data cannot be deserialized an `InvalidRequest` error kind is returned.
pub fn rmp_deserialize<'a, T>(buf: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    rmp_serde::from_slice(buf).map_err(|err| Error::new_ext(ErrorKind::InvalidRequest, err))
}
