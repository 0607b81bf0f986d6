use agentbridge_frame::{COMMAND, CONTROL, DEFAULT_MAX_PAYLOAD, TELEMETRY};
use agentbridge_peer::{DEFAULT_RECEIVE_TIMEOUT, DEFAULT_REPLY_TIMEOUT};

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("agentbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: agentbridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("AGENTBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("git_hash: {}", option_env!("GIT_HASH").unwrap_or("unknown"));
    println!("channels: control={CONTROL}, command={COMMAND}, telemetry={TELEMETRY}");
    println!("max_payload: {DEFAULT_MAX_PAYLOAD}");
    println!(
        "timeouts: reply={}ms, receive={}ms",
        DEFAULT_REPLY_TIMEOUT.as_millis(),
        DEFAULT_RECEIVE_TIMEOUT.as_millis()
    );
    println!("features: peer={}, cli=true", cfg!(feature = "peer"));

    Ok(SUCCESS)
}
