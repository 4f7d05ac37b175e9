//! Runs JSON test vectors through the receiver and diffs the decoded output.
//!
//! Each vector gives per-channel sample-level waveforms (`"0"`/`"1"`, one
//! character per sample tick; unlisted channels and exhausted lines idle
//! high) plus the expected byte and error sequences.

use clap::Parser;
use env_logger::Env;
use serde::Deserialize;
use std::error::Error;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::{fs, process};
use uartrx_core::traits::RxSink;
use uartrx_core::Receiver;

#[derive(Debug, Clone, Default)]
struct CaptureSink {
    bytes: Vec<(u8, u8)>,
    errors: Vec<(u8, u8)>,
}

impl RxSink for CaptureSink {
    fn push_byte(&mut self, channel: u8, byte: u8) {
        self.bytes.push((channel, byte));
    }

    fn push_error(&mut self, channel: u8, code: u8) {
        self.errors.push((channel, code));
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Line {
    channel: u8,
    levels: String,
}

#[derive(Debug, Clone, Deserialize)]
struct TestDescription {
    name: String,
    lines: Vec<Line>,
    #[serde(default)]
    bytes: Vec<(u8, u8)>,
    #[serde(default)]
    errors: Vec<(u8, u8)>,
}

#[derive(Debug, Clone, Parser)]
struct Args {
    #[arg(short = 'f', long)]
    file_path: Option<String>,
    #[arg(short = 'd', long)]
    directory_path: Option<String>,
    /// Additionally re-run every vector split in two at every sample index,
    /// requiring output identical to the unsplit run
    #[arg(long)]
    split_check: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    match (args.file_path, args.directory_path) {
        (Some(file_path), None) => {
            run_file(&file_path, args.split_check)?;
        }
        (None, Some(directory_path)) => {
            run_directory(&directory_path, args.split_check)?;
        }
        _ => {
            eprintln!(
                "ERROR: Exactly one of -f and -d must be set; use -h to see full help output"
            );
            process::exit(1);
        }
    }

    Ok(())
}

fn run_directory(directory_path: &str, split_check: bool) -> Result<(), Box<dyn Error>> {
    let mut file_paths: Vec<_> = fs::read_dir(directory_path)?
        .filter_map(Result::ok)
        .filter_map(|dir_entry| {
            let path = dir_entry.path();
            (path.extension().and_then(OsStr::to_str) == Some("json")).then_some(path)
        })
        .collect();

    file_paths.sort();

    for file_path in file_paths {
        run_file(&file_path, split_check)?;
    }

    Ok(())
}

fn run_file<P: AsRef<Path>>(file_path: P, split_check: bool) -> Result<(), Box<dyn Error>> {
    let file_path = file_path.as_ref();

    let file = File::open(file_path)?;
    let test_descriptions: Vec<TestDescription> = serde_json::from_reader(BufReader::new(file))?;
    let num_tests = test_descriptions.len();

    log::info!("Loaded {num_tests} tests from '{}'", file_path.display());

    let mut failures = 0_u32;
    for test_description in test_descriptions {
        let errors = run_test(&test_description, split_check);
        if !errors.is_empty() {
            failures += 1;

            log::error!("Failed test '{}':", test_description.name);
            for error in errors {
                log::error!("  {error}");
            }
        }
    }

    if failures != 0 {
        log::info!("Failed {failures} out of {num_tests} in '{}'", file_path.display());
    }

    Ok(())
}

fn compose_words(lines: &[Line]) -> Vec<u32> {
    let len = lines.iter().map(|line| line.levels.len()).max().unwrap_or(0);

    (0..len)
        .map(|i| {
            let mut word = u32::MAX;
            for line in lines {
                match line.levels.as_bytes().get(i) {
                    Some(b'0') => word &= !(1 << line.channel),
                    Some(b'1') | None => {}
                    Some(&other) => panic!("unexpected level character: {}", other as char),
                }
            }
            word
        })
        .collect()
}

fn run_test(description: &TestDescription, split_check: bool) -> Vec<String> {
    let words = compose_words(&description.lines);

    let mut rx = Receiver::new();
    let mut sink = CaptureSink::default();
    rx.process(&words, &mut sink);

    let mut errors = check_output(&sink, description);

    if split_check {
        for split in 1..words.len() {
            let mut rx = Receiver::new();
            let mut split_sink = CaptureSink::default();
            rx.process(&words[..split], &mut split_sink);
            rx.process(&words[split..], &mut split_sink);

            if split_sink.bytes != sink.bytes || split_sink.errors != sink.errors {
                errors.push(format!("output changed when split at sample {split}"));
            }
        }
    }

    errors
}

fn check_output(sink: &CaptureSink, description: &TestDescription) -> Vec<String> {
    let mut errors = Vec::new();

    if sink.bytes != description.bytes {
        errors.push(format!(
            "bytes: actual={:02X?}, expected={:02X?}",
            sink.bytes, description.bytes
        ));
    }

    if sink.errors != description.errors {
        errors.push(format!(
            "errors: actual={:02X?}, expected={:02X?}",
            sink.errors, description.errors
        ));
    }

    errors
}
