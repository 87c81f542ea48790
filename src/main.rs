// Copyright © 2021 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0

use clap::{Arg, ArgAction, ArgMatches, Command};
use vdisk::{hex_dump, init_logger, parse_sector_range, parse_size, print_error_chain};
use vhdx::vhdx_header::{HeaderSection, BAT_GUID};
use vhdx::vhdx_metadata::DiskSpec;
use vhdx::{DiskType, Vhdx};

fn create_app() -> Command {
    Command::new("vhdx-tool")
        .about("Inspect, create and access VHDX virtual disk images")
        .arg(
            Arg::new("create")
                .short('c')
                .value_name("TYPE")
                .help("Create a disk: 2=fixed, 3=dynamic, 4=differencing"),
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
            Arg::new("bat")
                .short('b')
                .value_name("SECTOR")
                .help("Show the BAT entries covering a sector"),
        )
        .arg(Arg::new("file").required(true).value_name("FILE"))
}

fn main() {
    init_logger("vhdx-tool");
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
    } else if let Some(sector) = matches.get_one::<String>("bat") {
        show_bat(sector, &file)
    } else {
        show(&file)
    }
}

fn create_disk(matches: &ArgMatches, file: &str) -> i32 {
    let type_arg = matches.get_one::<String>("create").unwrap();
    let disk_type: i32 = type_arg.parse().unwrap_or(-1);
    if !(2..=4).contains(&disk_type) {
        eprintln!("invalid disk type '{type_arg}', expected 2, 3 or 4");
        return 1;
    }

    if disk_type == 4 {
        let Some(parent) = matches.get_one::<String>("parent") else {
            eprintln!("creating a differencing disk requires -p");
            return 1;
        };
        let absolute = matches.get_one::<String>("absolute-path").map(String::as_str);
        let relative = matches.get_one::<String>("relative-path").map(String::as_str);

        if let Err(e) = Vhdx::create_differencing(file, parent, absolute, relative) {
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
        Vhdx::create_fixed(file, size)
    } else {
        Vhdx::create_dynamic(file, size)
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

    let mut disk = match Vhdx::open(file, false) {
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

    let mut disk = match Vhdx::open(file, true) {
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

    let mut buf =
        vec![0u8; (count as usize) << disk.disk_spec().logical_sector_size_bits];
    if let Err(e) = disk.read(sector, count, &mut buf) {
        print_error_chain(&e, "read");
        return -1;
    }

    hex_dump(&buf, true);
    0
}

fn show_bat(sector_arg: &str, file: &str) -> i32 {
    let Ok(sector) = sector_arg.parse::<u64>() else {
        eprintln!("invalid sector number '{sector_arg}'");
        return 1;
    };

    let disk = match Vhdx::open(file, true) {
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

    let spec = disk.disk_spec();
    let mut bat_index = (sector >> spec.sectors_per_block_bits) as usize;
    bat_index += bat_index >> spec.chunk_ratio_bits;

    let payload = disk.bat()[bat_index];
    println!(
        "#sector: {}, payload bat index: {}, raw value: {:#018X}",
        sector, bat_index, payload.0
    );
    println!(
        "status: {}, offset: {:#018X}\n",
        payload
            .payload_status()
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "Unknown".to_string()),
        payload.file_offset()
    );

    if disk.disk_type() == DiskType::Differencing {
        let chunk_ratio = spec.chunk_ratio as usize;
        let bat_idx_in_chunk = bat_index >> spec.chunk_ratio_bits;
        let bitmap_index = ((bat_idx_in_chunk + 1) << spec.chunk_ratio_bits) + bat_idx_in_chunk;

        let bitmap = disk.bat()[bitmap_index];
        println!(
            "#sector: {}, bitmap bat index: {}, raw value: {:#018X}",
            sector, bitmap_index, bitmap.0
        );
        println!(
            "status: {}, offset: {:#018X}\n",
            bitmap
                .bitmap_status()
                .map(|s| s.to_string())
                .unwrap_or_else(|_| "Unknown".to_string()),
            bitmap.file_offset()
        );

        // Dump the whole surrounding chunk, bitmap entry included.
        let chunk_begin = bat_idx_in_chunk * chunk_ratio + bat_idx_in_chunk;
        println!("bat index: {bat_index}, chunk bat index begin: {chunk_begin}");
        for i in 0..=chunk_ratio {
            if i % 4 == 0 {
                print!("{i:08X}: ");
            }
            print!("{:016x} ", disk.bat()[chunk_begin + i].0);
            if (i + 1) % 4 == 0 {
                println!();
            }
        }
        println!();
    }

    0
}

fn show(file: &str) -> i32 {
    let mut disk = match Vhdx::open(file, true) {
        Ok(disk) => disk,
        Err(e) => {
            print_error_chain(&e, "open");
            return -1;
        }
    };

    show_header_section(disk.header_section());
    show_metadata(disk.disk_spec());

    if disk.disk_type() == DiskType::Differencing && disk.build_parent_list().is_ok() {
        println!("=== parent ===");
        for parent in disk.parents() {
            show_metadata(parent.disk_spec());
        }
    }

    0
}

fn show_header_section(section: &HeaderSection) {
    println!("=== file identifier ===");
    println!("creator   : {}\n", section.file_identifier().creator);

    for (i, header) in section.headers().iter().enumerate() {
        println!("=== Header[{i}] ===");
        match header {
            Some(h) => {
                println!("checksum        : {:#010X}", h.checksum);
                println!("sequence number : {} ({:#X})", h.sequence_number, h.sequence_number);
                println!("file write guid : {}", h.file_write_guid);
                println!("data write guid : {}", h.data_write_guid);
                println!("log guid        : {}", h.log_guid);
                println!("log version     : {}", h.log_version);
                println!("file version    : {}", h.version);
                println!("log length      : {} ({:#X})", h.log_length, h.log_length);
                println!("log offset      : {} ({:#X})\n", h.log_offset, h.log_offset);
            }
            None => println!("invalid\n"),
        }
    }

    for (i, table) in section.region_tables().iter().enumerate() {
        println!("=== Region table[{i}] ===");
        match table {
            Some(t) => {
                println!("checksum    : {:#010X}", t.checksum);
                println!("entry count : {}", t.entries.len());
                for (j, entry) in t.entries.iter().enumerate() {
                    let label = if entry.guid.to_string().eq_ignore_ascii_case(BAT_GUID) {
                        "BAT"
                    } else {
                        "Metadata"
                    };
                    println!("Region entry[{j}]");
                    println!("\tguid        : {} ({})", entry.guid, label);
                    println!(
                        "\tfile offset : {} ({:#X})",
                        entry.file_offset, entry.file_offset
                    );
                    println!("\tlength      : {} ({:#X})", entry.length, entry.length);
                    println!("\trequired    : {}", entry.required);
                }
                println!();
            }
            None => println!("invalid\n"),
        }
    }
}

fn show_metadata(spec: &DiskSpec) {
    println!("=== metadata ===");
    println!("block size           : {}", spec.block_size);
    println!("disk size            : {}", spec.virtual_disk_size);
    println!("disk guid            : {}", spec.disk_id);
    println!("logical sector size  : {}", spec.logical_sector_size);
    println!("physical sector size : {}\n", spec.physical_sector_size);
    println!("disk type            : {}\n", spec.disk_type.as_str());

    if spec.disk_type == DiskType::Differencing {
        println!("linkage              : {}", spec.parent_linkage().unwrap_or(""));
        println!("linkage2             : {}", spec.parent_linkage2().unwrap_or(""));
        println!(
            "relative_path        : {}",
            spec.parent_relative_path().unwrap_or("")
        );
        println!(
            "volume_path          : {}",
            spec.parent_volume_path().unwrap_or("")
        );
        println!(
            "absolute_win32_path  : {}\n",
            spec.parent_absolute_win32_path().unwrap_or("")
        );
    }

    println!("chunk ratio          : {}", spec.chunk_ratio);
    println!("data block count     : {}", spec.data_block_count);
    println!("bitmap block count   : {}", spec.bitmap_block_count);
    println!("total bat count      : {}\n", spec.total_bat_count);
}
