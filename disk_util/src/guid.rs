// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

/// Decode a GUID from its VHDX on-disk layout: Data1, Data2 and Data3 are
/// stored little-endian, Data4 is a byte array stored as-is.
pub fn from_le_bytes(buf: &[u8; 16]) -> Uuid {
    Uuid::from_fields(
        LittleEndian::read_u32(&buf[0..4]),
        LittleEndian::read_u16(&buf[4..6]),
        LittleEndian::read_u16(&buf[6..8]),
        buf[8..16].try_into().unwrap(),
    )
}

/// Encode a GUID into its VHDX on-disk layout.
pub fn to_le_bytes(uuid: &Uuid) -> [u8; 16] {
    let (d1, d2, d3, d4) = uuid.as_fields();
    let mut buf = [0u8; 16];
    LittleEndian::write_u32(&mut buf[0..4], d1);
    LittleEndian::write_u16(&mut buf[4..6], d2);
    LittleEndian::write_u16(&mut buf[6..8], d3);
    buf[8..16].copy_from_slice(d4);
    buf
}

/// Format a GUID the way parent locator values store it: braced, lowercase,
/// hyphenated.
pub fn to_braced_string(uuid: &Uuid) -> String {
    format!("{}", uuid.braced())
}

/// Compare a parent locator linkage value against a GUID, tolerating braces
/// and letter case.
pub fn linkage_matches(linkage: &str, uuid: &Uuid) -> bool {
    let trimmed = linkage.trim_start_matches('{').trim_end_matches('}');
    trimmed.eq_ignore_ascii_case(&uuid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_le_codec_round_trip() {
        let uuid = Uuid::new_v4();
        assert_eq!(from_le_bytes(&to_le_bytes(&uuid)), uuid);
    }

    #[test]
    fn test_known_le_layout() {
        // The BAT region GUID 2DC27766-F623-4200-9D64-115E9BFD4A08 as it
        // appears on disk.
        let on_disk: [u8; 16] = [
            0x66, 0x77, 0xC2, 0x2D, 0x23, 0xF6, 0x00, 0x42, 0x9D, 0x64, 0x11, 0x5E, 0x9B, 0xFD,
            0x4A, 0x08,
        ];
        let uuid = from_le_bytes(&on_disk);
        assert_eq!(
            uuid,
            Uuid::parse_str("2DC27766-F623-4200-9D64-115E9BFD4A08").unwrap()
        );
        assert_eq!(to_le_bytes(&uuid), on_disk);
    }

    #[test]
    fn test_linkage_matches() {
        let uuid = Uuid::parse_str("83ED0EC3-24C8-49A6-A959-5E4BF1288BFB").unwrap();
        assert!(linkage_matches(
            "{83ed0ec3-24c8-49a6-a959-5e4bf1288bfb}",
            &uuid
        ));
        assert!(linkage_matches(
            "83ED0EC3-24C8-49A6-A959-5E4BF1288BFB",
            &uuid
        ));
        assert!(!linkage_matches("{00000000-0000-0000-0000-000000000000}", &uuid));
        assert_eq!(
            to_braced_string(&uuid),
            "{83ed0ec3-24c8-49a6-a959-5e4bf1288bfb}"
        );
    }
}
