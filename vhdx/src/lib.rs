// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Read/write access to VHDX disk images: fixed, dynamic and differencing,
//! including crash recovery through the write-ahead log. All multi-byte
//! on-disk fields are little-endian.

macro_rules! div_round_up {
    ($n:expr,$d:expr) => {
        ($n + $d - 1) / $d
    };
}

pub mod vhdx;
pub mod vhdx_bat;
pub mod vhdx_header;
mod vhdx_io;
mod vhdx_log;
pub mod vhdx_metadata;

pub use vhdx::{Vhdx, VhdxError};
pub use vhdx_metadata::DiskType;
