use muxrpc_channel::DEFAULT_KEEPALIVE_INTERVAL;
use muxrpc_frame::DEFAULT_MAX_FRAME_SIZE;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("muxrpc {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: muxrpc");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!(
        "rustc: {}",
        option_env!("RUSTC_VERSION").unwrap_or("unknown")
    );
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!(
        "keepalive_interval: {}s",
        DEFAULT_KEEPALIVE_INTERVAL.as_secs()
    );
    println!("max_frame_size: {DEFAULT_MAX_FRAME_SIZE}");
    println!("codecs: array, keyed");

    Ok(SUCCESS)
}
