// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

/// Calculate a CRC-32C over a sequence of byte slices, chaining the
/// intermediate value across slice boundaries.
///
/// VHDX log entries are checksummed across a header sector, descriptor
/// sectors and data sectors that are never contiguous in memory, so the
/// extend primitive is the only form the callers use.
pub fn crc32c_over<'a, I>(bufs: I) -> u32
where
    I: IntoIterator<Item = &'a [u8]>,
{
    bufs.into_iter().fold(0, crc32c::crc32c_append)
}

/// CRC-32C over a single contiguous buffer.
pub fn crc32c_single(buf: &[u8]) -> u32 {
    crc32c::crc32c(buf)
}

/// The VHD (V1) summation checksum: the ones complement of the byte sum of
/// the structure, computed with its checksum field zeroed.
pub fn ones_complement_sum(buf: &[u8]) -> u32 {
    !buf.iter().fold(0u32, |sum, &b| sum.wrapping_add(b as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32c_chaining() {
        let data = b"123456789abcdef";
        let whole = crc32c_single(data);
        assert_eq!(crc32c_over([&data[..]]), whole);
        assert_eq!(crc32c_over([&data[..4], &data[4..9], &data[9..]]), whole);
        assert_eq!(crc32c_over([&data[..], &[][..]]), whole);
    }

    #[test]
    fn test_crc32c_known_value() {
        // RFC 3720 test vector.
        assert_eq!(crc32c_single(b"123456789"), 0xE306_9283);
    }

    #[test]
    fn test_ones_complement_sum() {
        assert_eq!(ones_complement_sum(&[]), 0xFFFF_FFFF);
        assert_eq!(ones_complement_sum(&[1, 2, 3]), !6u32);

        // Placing the computed checksum back and re-summing with the field
        // zeroed must reproduce it, which is how the footer validates.
        let mut buf = [0u8; 512];
        buf[9] = 0xAB;
        let csum = ones_complement_sum(&buf);
        assert_eq!(ones_complement_sum(&buf), csum);
    }
}
