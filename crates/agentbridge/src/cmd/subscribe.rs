use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use agentbridge_peer::{
    BridgeError, Subscription, TelemetryChannel, TelemetryConfig, TelemetryTransport,
};
use agentbridge_transport::{Endpoint, ShutdownHandle};
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, SubscribeArgs, Wire};
use crate::exit::{bridge_error, CliError, CliResult, INTERRUPTED, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SubscribeArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let endpoint = Endpoint::new(args.host.clone(), args.port);
    let config = TelemetryConfig {
        timeout,
        ..TelemetryConfig::default()
    };

    let subscribed = |endpoint: &Endpoint| {
        if args.topic.is_empty() {
            info!(%endpoint, "subscribed to all topics");
        } else {
            info!(%endpoint, topic = %args.topic, "subscribed");
        }
    };
    match args.wire {
        Wire::Framed => {
            let subscription = TelemetryChannel::connect(&endpoint, config)
                .and_then(|channel| channel.subscribe(&args.topic))
                .map_err(|err| bridge_error("subscribe failed", err))?;
            subscribed(&endpoint);
            let handle = subscription.shutdown_handle();
            drive(subscription, handle, &args, format)
        }
        Wire::Zmq => {
            let subscription = TelemetryChannel::connect_zmq(&endpoint, config)
                .and_then(|channel| channel.subscribe(&args.topic))
                .map_err(|err| bridge_error("subscribe failed", err))?;
            subscribed(&endpoint);
            let handle = subscription.shutdown_handle();
            drive(subscription, handle, &args, format)
        }
    }
}

fn drive<T: TelemetryTransport>(
    mut subscription: Subscription<T>,
    handle: ShutdownHandle,
    args: &SubscribeArgs,
    format: OutputFormat,
) -> CliResult<i32> {
    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), Some(handle))?;

    let mut printed = 0usize;
    let mut idle = 0u32;
    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
        match subscription.receive() {
            Ok(Some(message)) => {
                idle = 0;
                printed += 1;
                print_message(&message, format);
            }
            Ok(None) => {}
            Err(BridgeError::NoMessageAvailable(waited)) => {
                idle += 1;
                debug!(waited_ms = waited.as_millis() as u64, idle, "no telemetry yet");
                if args.idle_limit.is_some_and(|limit| idle >= limit) {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("no telemetry for {idle} receive windows"),
                    ));
                }
            }
            Err(err @ BridgeError::MalformedMessage(_)) => {
                warn!(error = %err, "skipping malformed message");
            }
            Err(_) if !running.load(Ordering::SeqCst) => break,
            Err(err) => return Err(bridge_error("receive failed", err)),
        }
    }

    debug!(printed, dropped = subscription.dropped(), "subscription finished");
    if running.load(Ordering::SeqCst) {
        Ok(SUCCESS)
    } else {
        Ok(INTERRUPTED)
    }
}
