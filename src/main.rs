//! Thin CLI harness for the evacuation engine: parses a handful of flags,
//! opens a clearing request against a real device, runs it, and reports
//! efficacy. Not the product — see the library crate for that.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use spaceman::kernel::linux::LinuxKernel;
use spaceman::{Attrs, Device, Request, TraceMask};

/// Parsed command-line arguments.
struct Args {
    device_path: PathBuf,
    realtime_path: Option<PathBuf>,
    realtime: bool,
    start: u64,
    length: u64,
    trace_mask: TraceMask,
    open_directory: PathBuf,
    display_name: Option<String>,
}

fn usage() -> &'static str {
    "usage: spaceman --device <path> --start <bytes> --length <bytes> \
     [--realtime] [--realtime-device <path>] [--dir <path>] \
     [--trace <cat,cat,...>] [--name <string>]"
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args, String> {
    let mut device_path = None;
    let mut realtime_path = None;
    let mut realtime = false;
    let mut start = None;
    let mut length = None;
    let mut trace_mask = TraceMask::empty();
    let mut open_directory = PathBuf::from(".");
    let mut display_name = None;

    while let Some(arg) = args.next() {
        let mut value = || args.next().ok_or_else(|| format!("{arg}: missing value"));
        match arg.as_str() {
            "--device" => device_path = Some(PathBuf::from(value()?)),
            "--realtime-device" => realtime_path = Some(PathBuf::from(value()?)),
            "--realtime" => realtime = true,
            "--start" => {
                start = Some(value()?.parse::<u64>().map_err(|e| format!("--start: {e}"))?)
            }
            "--length" => {
                length = Some(
                    value()?
                        .parse::<u64>()
                        .map_err(|e| format!("--length: {e}"))?,
                )
            }
            "--trace" => trace_mask |= TraceMask::parse_list(&value()?),
            "--dir" => open_directory = PathBuf::from(value()?),
            "--name" => display_name = Some(value()?),
            "-h" | "--help" => return Err(usage().to_owned()),
            other => return Err(format!("unrecognized argument: {other}")),
        }
    }

    let device_path = device_path.ok_or("--device is required")?;
    let start = start.ok_or("--start is required")?;
    let length = length.ok_or("--length is required")?;

    Ok(Args {
        device_path,
        realtime_path,
        realtime,
        start,
        length,
        trace_mask,
        open_directory,
        display_name,
    })
}

fn run(args: Args) -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let display_name = args
        .display_name
        .unwrap_or_else(|| args.device_path.display().to_string());
    let kernel = LinuxKernel::new(args.device_path, args.realtime_path);
    let attrs = Attrs {
        device: if args.realtime {
            Device::Realtime
        } else {
            Device::Data
        },
        start: args.start,
        length: args.length,
        trace_mask: args.trace_mask,
        open_directory: args.open_directory,
        display_name,
    };

    let mut request = Request::new(kernel, attrs).map_err(|e| e.to_string())?;
    request.run().map_err(|e| e.to_string())?;
    println!("cleared {}", spaceman::util::format_bytes(request.efficacy()));
    Ok(())
}

fn main() -> ExitCode {
    let args = match parse_args(env::args().skip(1)) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("spaceman: {e}");
            return ExitCode::FAILURE;
        }
    };
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("spaceman: {e}");
            ExitCode::FAILURE
        }
    }
}
