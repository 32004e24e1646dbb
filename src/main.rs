//! Offline CLI for the filtering engine.
//!
//! Hand-rolled argument parsing (no clap dependency) to keep the binary
//! small and boot fast.
//!
//! # Grammar
//!
//! ```text
//! ubx compile --out <snapshot> [--psl <file>] [--no-crc] [--build-id <n>] <lists...>
//! ubx inspect <snapshot>
//! ubx match <snapshot> <url> [--type <name>] [--from <url>] [--tab <n>]
//! ubx --help | -h
//! ```

use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process::exit;

use memmap2::Mmap;

use ubx_engine::{compile_filter_lists, CompileOptions, Engine, EngineConfig, RequestInfo};

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let mut args = env::args_os();
    let exe = args.next().unwrap_or_else(|| "ubx".into());

    let command = match args.next() {
        Some(c) => c,
        None => {
            print_usage(&exe);
            exit(2);
        }
    };

    match command.to_string_lossy().as_ref() {
        "--help" | "-h" => {
            print_usage(&exe);
            Ok(())
        }
        "compile" => cmd_compile(args),
        "inspect" => cmd_inspect(args),
        "match" => cmd_match(args),
        other => {
            eprintln!("error: unknown command '{other}'");
            eprintln!();
            print_usage(&exe);
            exit(2);
        }
    }
}

fn print_usage(exe: &std::ffi::OsStr) {
    let exe = exe.to_string_lossy();
    eprintln!("usage:");
    eprintln!("  {exe} compile --out <snapshot> [--psl <file>] [--no-crc] [--build-id <n>] <lists...>");
    eprintln!("  {exe} inspect <snapshot>");
    eprintln!("  {exe} match <snapshot> <url> [--type <name>] [--from <url>] [--tab <n>]");
}

fn bail(msg: &str) -> ! {
    eprintln!("error: {msg}");
    exit(2);
}

fn cmd_compile(args: env::ArgsOs) -> io::Result<()> {
    let mut out_path: Option<PathBuf> = None;
    let mut psl_path: Option<PathBuf> = None;
    let mut options = CompileOptions::default();
    let mut list_paths: Vec<PathBuf> = Vec::new();

    let mut args = args;
    while let Some(arg) = args.next() {
        match arg.to_string_lossy().as_ref() {
            "--out" => out_path = Some(next_path(&mut args, "--out")),
            "--psl" => psl_path = Some(next_path(&mut args, "--psl")),
            "--no-crc" => options.crc = false,
            "--build-id" => {
                let raw = next_value(&mut args, "--build-id");
                options.build_id = raw
                    .to_string_lossy()
                    .parse()
                    .unwrap_or_else(|_| bail("--build-id expects an integer"));
            }
            _ => list_paths.push(PathBuf::from(arg)),
        }
    }

    let out_path = out_path.unwrap_or_else(|| bail("compile requires --out"));
    if list_paths.is_empty() {
        bail("compile requires at least one list file");
    }

    if let Some(path) = psl_path {
        options.psl_text = Some(fs::read_to_string(path)?);
    }

    let mut texts = Vec::with_capacity(list_paths.len());
    for path in &list_paths {
        texts.push(fs::read_to_string(path)?);
    }
    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();

    let output = match compile_filter_lists(&refs, &options) {
        Ok(output) => output,
        Err(err) => bail(&format!("compile failed: {err}")),
    };

    fs::write(&out_path, &output.snapshot_bytes)?;

    let stats = serde_json::json!({
        "snapshot": out_path.display().to_string(),
        "snapshot_bytes": output.snapshot_bytes.len(),
        "stats": output.stats,
        "skipped_by_reason": skipped_map(&output.stats),
    });
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn skipped_map(stats: &ubx_engine::CompileStats) -> serde_json::Value {
    use ubx_engine::SkipReason;
    let reasons = [
        SkipReason::UnknownOption,
        SkipReason::EmptyPattern,
        SkipReason::NonAsciiDomain,
        SkipReason::RegexTooLong,
        SkipReason::RegexTooComplex,
        SkipReason::ListTooLarge,
        SkipReason::TooManyRules,
        SkipReason::MalformedCosmetic,
        SkipReason::UnsupportedOption,
    ];
    let mut map = serde_json::Map::new();
    for reason in reasons {
        let count = stats.skipped[reason.index()];
        if count > 0 {
            map.insert(reason.name().to_string(), count.into());
        }
    }
    map.into()
}

fn cmd_inspect(mut args: env::ArgsOs) -> io::Result<()> {
    let path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| bail("inspect requires a snapshot path"));

    let bytes = map_snapshot(&path)?;
    let mut engine = Engine::new(EngineConfig::default());
    if let Err(err) = engine.install(bytes) {
        bail(&format!("invalid snapshot: {err}"));
    }
    let info = engine.snapshot_info();
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

fn cmd_match(mut args: env::ArgsOs) -> io::Result<()> {
    let path = args
        .next()
        .map(PathBuf::from)
        .unwrap_or_else(|| bail("match requires a snapshot path"));
    let url = args
        .next()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| bail("match requires a URL"));

    let mut type_name = String::from("other");
    let mut initiator: Option<String> = None;
    let mut tab_id = 1i32;

    let mut rest = args;
    while let Some(arg) = rest.next() {
        match arg.to_string_lossy().as_ref() {
            "--type" => type_name = next_value(&mut rest, "--type").to_string_lossy().into_owned(),
            "--from" => {
                initiator = Some(next_value(&mut rest, "--from").to_string_lossy().into_owned())
            }
            "--tab" => {
                tab_id = next_value(&mut rest, "--tab")
                    .to_string_lossy()
                    .parse()
                    .unwrap_or_else(|_| bail("--tab expects an integer"));
            }
            other => bail(&format!("unknown match flag '{other}'")),
        }
    }

    let bytes = map_snapshot(&path)?;
    let mut engine = Engine::new(EngineConfig::default());
    if let Err(err) = engine.install(bytes) {
        bail(&format!("invalid snapshot: {err}"));
    }

    let verdict = engine.match_request(&RequestInfo {
        url: &url,
        type_name: &type_name,
        initiator: initiator.as_deref(),
        tab_id,
        frame_id: 0,
        request_id: 0,
    });
    println!("{}", serde_json::to_string_pretty(&verdict)?);
    Ok(())
}

/// Maps a snapshot file and hands the bytes to the engine. The map is
/// short-lived: the engine owns its own copy so the file can change on disk
/// afterwards without invalidating the installed snapshot.
fn map_snapshot(path: &PathBuf) -> io::Result<Vec<u8>> {
    let file = File::open(path)?;
    // SAFETY: the mapping is read-only and copied out before returning.
    let map = unsafe { Mmap::map(&file)? };
    Ok(map.to_vec())
}

fn next_value<I: Iterator<Item = OsString>>(args: &mut I, flag: &str) -> OsString {
    args.next()
        .unwrap_or_else(|| bail(&format!("{flag} expects a value")))
}

fn next_path<I: Iterator<Item = OsString>>(args: &mut I, flag: &str) -> PathBuf {
    PathBuf::from(next_value(args, flag))
}
