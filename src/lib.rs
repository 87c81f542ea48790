// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

//! Shared plumbing for the `vhdx-tool` and `vhd-tool` front-ends: logger
//! setup, argument value parsers and the sector hex dump.

use std::sync::Mutex;

use log::LevelFilter;

pub const MAX_DISK_SIZE: u64 = 64 * disk_util::TIB;

struct Logger {
    program: &'static str,
    output: Mutex<Box<dyn std::io::Write + Send>>,
    start: std::time::Instant,
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let duration = self.start.elapsed();
        writeln!(
            *(*(self.output.lock().unwrap())),
            "{}: {:.6?}: <{}> {} -- {}",
            self.program,
            duration,
            record.level(),
            record.target(),
            record.args()
        )
        .ok();
    }

    fn flush(&self) {}
}

pub fn init_logger(program: &'static str) {
    let logger = Logger {
        program,
        output: Mutex::new(Box::new(std::io::stderr())),
        start: std::time::Instant::now(),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(LevelFilter::Warn);
    }
}

/// Prints a chain of errors to the user in a consistent manner.
pub fn print_error_chain(top_error: &dyn std::error::Error, component: &str) {
    eprint!("Error: {component} failed with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| sub_error.source())
            .enumerate()
            .for_each(|(level, error)| {
                eprintln!("  {level}: {error}");
            });
    }
}

/// Parse a `-s` disk size argument: `<value>{M|G|T}`, at most 64 TiB.
pub fn parse_size(arg: &str) -> Result<u64, String> {
    if arg.len() < 2 {
        return Err(format!("invalid size '{arg}'"));
    }

    let (value, unit) = arg.split_at(arg.len() - 1);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid size value '{value}'"))?;

    let size = match unit {
        "M" => value.checked_mul(disk_util::MIB),
        "G" => value.checked_mul(disk_util::GIB),
        "T" => value.checked_mul(disk_util::TIB),
        _ => return Err(format!("invalid size unit '{unit}', expected M, G or T")),
    }
    .ok_or_else(|| format!("size '{arg}' overflows"))?;

    if size == 0 || size > MAX_DISK_SIZE {
        return Err("disk size must be > 0 and at most 64T".to_string());
    }

    Ok(size)
}

/// Parse a `-r`/`-w` argument: `<sector>[:<count>]`, count defaulting to 1.
pub fn parse_sector_range(arg: &str) -> Result<(u64, u32), String> {
    let (sector, count) = match arg.split_once(':') {
        None => (arg, "1"),
        Some((sector, count)) => (sector, count),
    };

    let sector: u64 = sector
        .parse()
        .map_err(|_| format!("invalid sector number '{sector}'"))?;
    let count: u32 = count
        .parse()
        .map_err(|_| format!("invalid sector count '{count}'"))?;
    if count == 0 {
        return Err("sector count must be > 0".to_string());
    }

    Ok((sector, count))
}

/// Dump a buffer as hex, 16 bytes per line, optionally with an ASCII
/// gutter.
pub fn hex_dump(buf: &[u8], show_ascii: bool) {
    for (line, chunk) in buf.chunks(16).enumerate() {
        print!("{:08X}: ", line * 16);
        for byte in chunk {
            print!("{byte:02X} ");
        }

        if show_ascii {
            for _ in chunk.len()..16 {
                print!("   ");
            }
            for byte in chunk {
                let c = *byte as char;
                print!("{}", if c.is_ascii_graphic() || c == ' ' { c } else { '.' });
            }
        }
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("2M").unwrap(), 2 * disk_util::MIB);
        assert_eq!(parse_size("10G").unwrap(), 10 * disk_util::GIB);
        assert_eq!(parse_size("64T").unwrap(), 64 * disk_util::TIB);

        assert!(parse_size("65T").is_err());
        assert!(parse_size("0M").is_err());
        assert!(parse_size("10").is_err());
        assert!(parse_size("10K").is_err());
        assert!(parse_size("G").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_parse_sector_range() {
        assert_eq!(parse_sector_range("0").unwrap(), (0, 1));
        assert_eq!(parse_sector_range("123").unwrap(), (123, 1));
        assert_eq!(parse_sector_range("8:16").unwrap(), (8, 16));

        assert!(parse_sector_range("8:0").is_err());
        assert!(parse_sector_range("a").is_err());
        assert!(parse_sector_range("8:b").is_err());
        assert!(parse_sector_range("").is_err());
    }
}
