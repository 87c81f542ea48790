// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! UTF-8 ↔ UTF-16 transcoding with the byte order spelled out at the call
//! site. VHDX strings (creator, parent locator keys and values) are
//! UTF-16LE; the VHD sparse header's parent name is UTF-16BE.

/// Encode a UTF-8 string as UTF-16LE, without a terminating NUL.
pub fn utf8_to_utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

/// Encode a UTF-8 string as UTF-16BE, without a terminating NUL.
pub fn utf8_to_utf16be(s: &str) -> Vec<u8> {
    s.encode_utf16()
        .flat_map(|unit| unit.to_be_bytes())
        .collect()
}

/// Decode UTF-16LE bytes up to the first NUL code unit (or the buffer end).
pub fn utf16le_to_utf8(buf: &[u8]) -> String {
    decode(buf, u16::from_le_bytes)
}

/// Decode UTF-16BE bytes up to the first NUL code unit (or the buffer end).
pub fn utf16be_to_utf8(buf: &[u8]) -> String {
    decode(buf, u16::from_be_bytes)
}

fn decode(buf: &[u8], from_bytes: fn([u8; 2]) -> u16) -> String {
    let units: Vec<u16> = buf
        .chunks_exact(2)
        .map(|pair| from_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_round_trip() {
        let s = "../images/parent.vhdx";
        assert_eq!(utf16le_to_utf8(&utf8_to_utf16le(s)), s);
    }

    #[test]
    fn test_be_round_trip() {
        let s = "parent.vhd";
        assert_eq!(utf16be_to_utf8(&utf8_to_utf16be(s)), s);
    }

    #[test]
    fn test_byte_order_differs() {
        assert_eq!(utf8_to_utf16le("A"), vec![0x41, 0x00]);
        assert_eq!(utf8_to_utf16be("A"), vec![0x00, 0x41]);
    }

    #[test]
    fn test_decode_stops_at_nul() {
        let mut buf = utf8_to_utf16le("abc");
        buf.extend_from_slice(&[0, 0, 0x44, 0x00]);
        assert_eq!(utf16le_to_utf8(&buf), "abc");
    }

    #[test]
    fn test_decode_ignores_trailing_odd_byte() {
        let mut buf = utf8_to_utf16le("ab");
        buf.push(0x41);
        assert_eq!(utf16le_to_utf8(&buf), "ab");
    }
}
