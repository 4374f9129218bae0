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

//! Block-builder auction engine.
//!
//! For every upcoming block height of a registered chain the engine runs an
//! auction: searchers submit bids (ordered transaction bundles carrying
//! on-chain payments split between the elected proposer and the operator),
//! and when the proposer claims the block the engine ranks the bids, rejects
//! conflicting or underfunded ones, and packs the winners plus the remaining
//! mempool into a block that respects the proposer's byte and gas limits.

// External crates macros.
#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// Public modules.
pub mod auction;
pub mod chain;
pub mod cryptoutil;
pub mod error;
pub mod serialize;
pub mod store;

// Optional public modules.
#[cfg(feature = "rest")]
pub mod rest;

pub use auction::{CoreService, Service, ServiceManager};
pub use error::{Error, ErrorKind, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
