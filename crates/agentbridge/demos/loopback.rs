//! Loopback round trip: an action server and a telemetry publisher in one
//! process, driven by a command channel and a subscription.
//!
//! Run with:
//!   cargo run --example loopback --features peer

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use agentbridge::envelope::Action;
use agentbridge::peer::{
    ActionServer, ActionServerConfig, CommandChannel, CommandConfig, TelemetryChannel,
    TelemetryConfig, TelemetryPublisher,
};
use agentbridge::transport::Endpoint;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = ActionServer::bind(&Endpoint::new("127.0.0.1", 0), ActionServerConfig::default())?;
    let publisher = Arc::new(TelemetryPublisher::bind(&Endpoint::new("127.0.0.1", 0))?);
    let command_endpoint = server.endpoint();
    let telemetry_endpoint = publisher.endpoint().clone();

    let stop = Arc::new(AtomicBool::new(false));
    let serving = {
        let stop = Arc::clone(&stop);
        let publisher = Arc::clone(&publisher);
        thread::spawn(move || {
            server.serve(&stop, |request| {
                let agent = request.agent_id.unwrap_or(1);
                let topic = format!("/agents/{agent}/state");
                publisher
                    .publish(&topic, &serde_json::json!({"last_action": request.action}))
                    .map(|_| ())
                    .map_err(|err| err.to_string())
            })
        })
    };

    let mut subscription =
        TelemetryChannel::connect(&telemetry_endpoint, TelemetryConfig::default())?
            .subscribe("/agents/1")?;
    publisher.wait_for_subscribers(1, Duration::from_secs(2));

    let mut commands = CommandChannel::connect(&command_endpoint, CommandConfig::default())?;
    for action in [Action::Up, Action::RotateClockwise] {
        let reply = commands.dispatch_action(1, action)?;
        eprintln!("{action}: {:?}", reply.status());
        let message = subscription.next_message()?;
        eprintln!("{} {:?}", message.topic, message.data);
    }

    stop.store(true, Ordering::SeqCst);
    drop(commands);
    serving.join().map_err(|_| "server thread panicked")??;
    Ok(())
}
