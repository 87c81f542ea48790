// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use clap::{Arg, ArgAction, ArgMatches, Command};
use vdisk::{hex_dump, init_logger, parse_sector_range, parse_size, print_error_chain};
use vhd::{DiskType, Footer, SparseHeader, Vhd, SECTOR_SHIFT};

fn create_app() -> Command {
    Command::new("vhd-tool")
        .about("Inspect, create and access VHD virtual disk images")
        .arg(
            Arg::new("create")
                .short('c')
                .value_name("TYPE")
                .help("Create a disk: 2=fixed, 3=dynamic, 4=differencing; 0 empties an existing disk"),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .value_name("SIZE")
                .help("Disk size as <value>{M|G|T}, at most 64T"),
        )
        .arg(
            Arg::new("parent")
                .short('p')
                .value_name("PARENT")
                .help("Parent file for a differencing disk"),
        )
        .arg(
            Arg::new("absolute-path")
                .short('a')
                .value_name("PATH")
                .help("Parent absolute path to store in the parent locator"),
        )
        .arg(
            Arg::new("relative-path")
                .short('e')
                .value_name("PATH")
                .help("Parent relative path to store in the parent locator"),
        )
        .arg(
            Arg::new("modify-locator")
                .short('m')
                .action(ArgAction::SetTrue)
                .help("Modify the parent locator in place"),
        )
        .arg(
            Arg::new("read")
                .short('r')
                .value_name("SECTOR[:COUNT]")
                .help("Read sectors and hex dump them (count defaults to 1)"),
        )
        .arg(
            Arg::new("write")
                .short('w')
                .value_name("SECTOR[:COUNT]")
                .help("Write a synthetic byte pattern into sectors (for test)"),
        )
        .arg(
            Arg::new("bat")
                .short('b')
                .value_name("SECTOR")
                .help("Show the BAT entry covering a sector and its block bitmap"),
        )
        .arg(Arg::new("file").required(true).value_name("FILE"))
}

fn main() {
    init_logger("vhd-tool");
    std::process::exit(run());
}

fn run() -> i32 {
    let matches = match create_app().try_get_matches() {
        Ok(matches) => matches,
        Err(e) => {
            let code = match e.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return code;
        }
    };

    let file = matches.get_one::<String>("file").unwrap().clone();

    if matches.contains_id("create") {
        create_disk(&matches, &file)
    } else if matches.get_flag("modify-locator") {
        modify_locator(&matches, &file)
    } else if let Some(range) = matches.get_one::<String>("read") {
        read_sectors(range, &file)
    } else if let Some(range) = matches.get_one::<String>("write") {
        write_sectors(range, &file)
    } else if let Some(sector) = matches.get_one::<String>("bat") {
        show_bat_bitmap(sector, &file)
    } else {
        show(&file)
    }
}

fn create_disk(matches: &ArgMatches, file: &str) -> i32 {
    let type_arg = matches.get_one::<String>("create").unwrap();
    let disk_type: i32 = type_arg.parse().unwrap_or(-1);
    if !matches!(disk_type, 0 | 2 | 3 | 4) {
        eprintln!("invalid disk type '{type_arg}', expected 0, 2, 3 or 4");
        return 1;
    }

    if disk_type == 0 {
        if let Err(e) = Vhd::empty_disk(file) {
            print_error_chain(&e, "empty disk");
            return -1;
        }
        return 0;
    }

    if disk_type == 4 {
        let Some(parent) = matches.get_one::<String>("parent") else {
            eprintln!("creating a differencing disk requires -p");
            return 1;
        };
        let absolute = matches.get_one::<String>("absolute-path").map(String::as_str);
        let relative = matches.get_one::<String>("relative-path").map(String::as_str);

        if let Err(e) = Vhd::create_differencing(file, parent.as_str(), absolute, relative) {
            print_error_chain(&e, "create differencing");
            return -1;
        }
        return 0;
    }

    let Some(size_arg) = matches.get_one::<String>("size") else {
        eprintln!("creating a fixed or dynamic disk requires -s");
        return 1;
    };
    let size = match parse_size(size_arg) {
        Ok(size) => size,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let result = if disk_type == 2 {
        Vhd::create_fixed(file, size)
    } else {
        Vhd::create_dynamic(file, size)
    };
    if let Err(e) = result {
        print_error_chain(&e, "create");
        return -1;
    }

    0
}

fn modify_locator(matches: &ArgMatches, file: &str) -> i32 {
    let absolute = matches.get_one::<String>("absolute-path").map(String::as_str);
    let relative = matches.get_one::<String>("relative-path").map(String::as_str);
    if absolute.is_none() && relative.is_none() {
        eprintln!("modifying the parent locator requires -a or -e");
        return 1;
    }

    let mut disk = match Vhd::open(file, false) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    if disk.disk_type() != DiskType::Differencing {
        eprintln!("file: {file} type is not differencing");
        return -1;
    }

    if let Err(e) = disk.modify_parent_locator(absolute, relative) {
        print_error_chain(&e, "modify parent locator");
        return -1;
    }

    0
}

fn read_sectors(range: &str, file: &str) -> i32 {
    let (sector, count) = match parse_sector_range(range) {
        Ok(range) => range,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let mut disk = match Vhd::open(file, true) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    let max_sector = disk.total_sectors();
    if sector >= max_sector {
        eprintln!("file: {file}, requested #sector: {sector} exceeds max #sector: {max_sector}");
        return -1;
    }

    if disk.disk_type() != DiskType::Fixed {
        let spb = (disk.sparse_header().map(|h| h.block_size).unwrap_or(0) >> SECTOR_SHIFT) as u64;
        if spb != 0 {
            let bat_idx = (sector / spb) as usize;
            println!(
                "sector num: {} at bat table[{}]: {:#010X}",
                sector,
                bat_idx,
                disk.bat()[bat_idx].0
            );
        }
    }

    let mut buf = vec![0u8; (count as usize) << SECTOR_SHIFT];
    if let Err(e) = disk.read(sector, count, &mut buf) {
        print_error_chain(&e, "read");
        return -1;
    }

    hex_dump(&buf, true);
    0
}

fn write_sectors(range: &str, file: &str) -> i32 {
    let (sector, count) = match parse_sector_range(range) {
        Ok(range) => range,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };

    let mut disk = match Vhd::open(file, false) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    let buf: Vec<u8> = (0..(count as usize) << SECTOR_SHIFT)
        .map(|i| i as u8)
        .collect();
    if let Err(e) = disk.write(sector, count, &buf) {
        print_error_chain(&e, "write");
        return -1;
    }
    if let Err(e) = disk.close() {
        print_error_chain(&e, "close");
        return -1;
    }

    0
}

fn show_bat_bitmap(sector_arg: &str, file: &str) -> i32 {
    let Ok(sector) = sector_arg.parse::<u64>() else {
        eprintln!("invalid sector number '{sector_arg}'");
        return 1;
    };

    let disk = match Vhd::open(file, true) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    let max_sector = disk.total_sectors();
    if sector >= max_sector {
        eprintln!("file: {file}, requested #sector: {sector} exceeds max #sector: {max_sector}");
        return -1;
    }

    match disk.bat_entry_bitmap(sector) {
        Ok((_, entry, bitmap)) => {
            println!("sector num: {}, bat entry: {:#010X}", sector, entry.0);
            match bitmap {
                Some(bitmap) => {
                    println!("the sector belongs block bitmap:");
                    hex_dump(&bitmap, false);
                }
                None => println!("the sector belongs block is not allocated"),
            }
            0
        }
        Err(e) => {
            print_error_chain(&e, "read bat");
            -1
        }
    }
}

fn show(file: &str) -> i32 {
    let mut disk = match Vhd::open(file, true) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    show_footer(disk.footer());
    if let Some(header) = disk.sparse_header() {
        show_sparse_header(header, &disk);
    }

    if disk.disk_type() == DiskType::Differencing && disk.build_parent_list().is_ok() {
        println!("=== parent ===");
        for parent in disk.parents() {
            show_footer(parent.footer());
        }
    }

    0
}

fn show_footer(footer: &Footer) {
    println!("=== Footer ===");
    println!("features            : {:#010X}", footer.features);
    println!("file format version : {:#010X}", footer.file_format_version);
    println!(
        "data offset         : {} ({:#X})",
        footer.data_offset, footer.data_offset
    );
    println!("timestamp           : {:#010X}", footer.timestamp);
    println!(
        "creator app         : {}",
        String::from_utf8_lossy(&footer.creator_app)
    );
    println!("creator version     : {:#010X}", footer.creator_version);
    println!(
        "creator host os     : {}",
        String::from_utf8_lossy(&footer.creator_host_os)
    );
    println!(
        "original size       : {} ({:#X})",
        footer.original_size, footer.original_size
    );
    println!(
        "current size        : {} ({:#X})",
        footer.current_size, footer.current_size
    );
    println!(
        "CHS                 : c: {}, h: {}, s: {}",
        footer.geometry.cylinders, footer.geometry.heads, footer.geometry.sectors_per_track
    );
    println!("disk type           : {}", footer.disk_type.as_str());
    println!("checksum            : {:#010X}", footer.checksum);
    println!("disk uuid           : {}\n", footer.unique_id);
}

fn show_sparse_header(header: &SparseHeader, disk: &Vhd) {
    println!("=== Header ===");
    println!("data offset       : {:#018X}", header.data_offset);
    println!(
        "table offset      : {} ({:#X})",
        header.table_offset, header.table_offset
    );
    println!("header version    : {:#010X}", header.header_version);
    println!(
        "max table entries : {} ({:#X})",
        header.max_table_entries, header.max_table_entries
    );
    println!(
        "block size        : {} ({:#X})",
        header.block_size, header.block_size
    );
    println!("checksum          : {:#010X}", header.checksum);
    println!("parent disk uuid  : {}", header.parent_unique_id);
    println!("parent timestamp  : {:#010X}", header.parent_timestamp);
    println!("parent disk name  : {}\n", header.parent_name());

    if disk.disk_type() == DiskType::Differencing {
        println!("=== Parent locator ===");
        for (i, entry) in header.parent_locator_entries.iter().enumerate() {
            if !entry.is_populated() {
                continue;
            }

            println!("locator : {i}");
            let value = if entry.platform_code == vhd::PLATFORM_CODE_W2RU {
                disk.parent_relative_path()
            } else if entry.platform_code == vhd::PLATFORM_CODE_W2KU {
                disk.parent_absolute_path()
            } else {
                "(not supported)"
            };
            println!(
                "\tdata code   : {}",
                String::from_utf8_lossy(&entry.platform_code)
            );
            println!("\tdata value  : {value}");
            println!(
                "\tdata space  : {} ({:#X})",
                entry.data_space, entry.data_space
            );
            println!(
                "\tdata length : {} ({:#X})",
                entry.data_length, entry.data_length
            );
            println!(
                "\tdata offset : {} ({:#X})",
                entry.data_offset, entry.data_offset
            );
        }
        println!();
    }
}
