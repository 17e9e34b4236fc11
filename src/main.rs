use clap::*;
use clap_num::maybe_hex;
use exhume_udif::{FileSource, IgnoreMode, ReconstructOptions, UDIF};
use log::{debug, error, info, LevelFilter};
use regex::Regex;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

fn build_options(matches: &ArgMatches) -> ReconstructOptions {
    let mut options = ReconstructOptions {
        lenient_codecs: matches.get_flag("lenient"),
        verify_checksums: matches.get_flag("verify"),
        parallel: !matches.get_flag("sequential"),
        ..Default::default()
    };

    if let Some(pattern) = matches.get_one::<String>("partition") {
        match Regex::new(pattern) {
            Ok(filter) => options.partition_filter = Some(filter),
            Err(err) => {
                error!("Invalid partition filter '{}': {}", pattern, err);
                std::process::exit(1);
            }
        }
    }

    if let Some(reference) = matches.get_one::<String>("reference") {
        match FileSource::new(reference) {
            Ok(source) => {
                info!("Filling 'ignore' chunks from reference image '{}'", reference);
                options.ignore_mode = IgnoreMode::Reference(Arc::new(source));
            }
            Err(err) => {
                error!("Could not open reference image '{}': {}", reference, err);
                std::process::exit(1);
            }
        }
    }
    options
}

fn process_file(file_path: &str, options: &ReconstructOptions, matches: &ArgMatches) {
    info!("Processing the file '{}' in 'udif' format...", file_path);
    let mut reader = match UDIF::open_with(file_path, options) {
        Ok(reader) => reader,
        Err(err) => {
            error!("{}", err);
            std::process::exit(1);
        }
    };
    debug!("------------------------------------------------------------");
    info!("Selected format: UDIF");
    info!("Description: Apple Universal Disk Image Format (.dmg)");
    info!("Sector size: {:?}", reader.get_sector_size());
    debug!("------------------------------------------------------------");
    reader.print_info();

    if matches.get_flag("json") {
        match serde_json::to_string_pretty(&reader.summary()) {
            Ok(json) => println!("{}", json),
            Err(err) => error!("Could not serialize the summary: {}", err),
        }
    }

    if let Some(dir) = matches.get_one::<String>("dump") {
        if let Err(err) = reader.dump(dir) {
            error!("Could not dump images to '{}': {}", dir, err);
            std::process::exit(1);
        }
    }

    if let Some(size) = matches.get_one::<u64>("size") {
        let offset = matches.get_one::<u64>("offset").unwrap_or(&0);
        if let Err(err) = reader.seek(SeekFrom::Start(*offset)) {
            error!("Could not seek to 0x{:x}: {}", offset, err);
            std::process::exit(1);
        }
        let mut bytes = vec![0u8; *size as usize];
        match reader.read(&mut bytes) {
            Ok(count) => {
                bytes.truncate(count);
                let result = String::from_utf8_lossy(&bytes);
                println!("{}", result);
            }
            Err(err) => {
                error!("Read failed: {}", err);
                std::process::exit(1);
            }
        }
    }

    if !reader.image().is_complete() {
        error!(
            "{} partition(s) could not be reconstructed",
            reader.image().failures().len()
        );
        std::process::exit(2);
    }
}

fn main() {
    let matches = Command::new("exhume_udif")
        .version(crate_version!())
        .author(crate_authors!())
        .about("Reconstruct raw disk images from UDIF (.dmg) containers.")
        .arg(
            Arg::new("body")
                .short('b')
                .long("body")
                .value_parser(value_parser!(String))
                .required(true)
                .help("The path to the UDIF container."),
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("The size (in bytes) to read from the reconstructed disk."),
        )
        .arg(
            Arg::new("offset")
                .short('o')
                .long("offset")
                .value_parser(maybe_hex::<u64>)
                .required(false)
                .help("Read at a specific offset."),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .value_parser(value_parser!(String))
                .help("Write dump-<idx>.img per partition and dump-whole.img into this directory."),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the trailer and chunk tables as JSON."),
        )
        .arg(
            Arg::new("partition")
                .long("partition")
                .value_parser(value_parser!(String))
                .help("Only reconstruct partitions whose name matches this regex."),
        )
        .arg(
            Arg::new("lenient")
                .long("lenient")
                .action(ArgAction::SetTrue)
                .help("Leave chunks with unsupported codecs unfilled instead of failing."),
        )
        .arg(
            Arg::new("verify")
                .long("verify")
                .action(ArgAction::SetTrue)
                .help("Verify the CRC32 of every reconstructed partition."),
        )
        .arg(
            Arg::new("sequential")
                .long("sequential")
                .action(ArgAction::SetTrue)
                .help("Decode on a single thread."),
        )
        .arg(
            Arg::new("reference")
                .long("reference")
                .value_parser(value_parser!(String))
                .help("Raw image providing the content of 'ignore' chunks."),
        )
        .arg(
            Arg::new("log_level")
                .short('l')
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info")
                .help("Set the log verbosity level"),
        )
        .get_matches();

    let log_level_str = matches.get_one::<String>("log_level").unwrap();
    let level_filter = match log_level_str.as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    };

    env_logger::Builder::new().filter_level(level_filter).init();

    let file_path = matches.get_one::<String>("body").unwrap();
    let options = build_options(&matches);
    process_file(file_path, &options, &matches);
}
