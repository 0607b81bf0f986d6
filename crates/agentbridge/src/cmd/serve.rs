use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use agentbridge_envelope::{Action, IncomingAction};
use agentbridge_peer::{ActionServer, ActionServerConfig, TelemetryPublisher};
use agentbridge_transport::Endpoint;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, ServeArgs};
use crate::exit::{bridge_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Grid position and heading of one toy agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
struct Pose {
    x: i64,
    y: i64,
    /// Degrees counterclockwise from +x, in `0..360`.
    heading: u16,
}

impl Pose {
    fn apply(&mut self, action: Action) {
        match action {
            Action::Up => self.y += 1,
            Action::Down => self.y -= 1,
            Action::Left => self.x -= 1,
            Action::Right => self.x += 1,
            Action::RotateCounterclockwise => self.heading = (self.heading + 90) % 360,
            Action::RotateClockwise => self.heading = (self.heading + 270) % 360,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AgentState {
    agent_id: u32,
    pose: Pose,
    steps: u64,
    last_action: Option<Action>,
}

struct World {
    agents: Mutex<BTreeMap<u32, AgentState>>,
}

impl World {
    fn new(count: u32) -> Self {
        let agents = (1..=count)
            .map(|agent_id| {
                (
                    agent_id,
                    AgentState {
                        agent_id,
                        pose: Pose::default(),
                        steps: 0,
                        last_action: None,
                    },
                )
            })
            .collect();
        Self {
            agents: Mutex::new(agents),
        }
    }

    /// Apply a request. Legacy requests carry no agent id and address agent 1.
    fn apply(&self, request: &IncomingAction) -> Result<AgentState, String> {
        let agent_id = request.agent_id.unwrap_or(1);
        let mut agents = self.agents.lock().unwrap_or_else(PoisonError::into_inner);
        let state = agents
            .get_mut(&agent_id)
            .ok_or_else(|| format!("unknown agent {agent_id}"))?;
        state.pose.apply(request.action);
        state.steps += 1;
        state.last_action = Some(request.action);
        Ok(state.clone())
    }

    fn snapshot(&self) -> Vec<AgentState> {
        self.agents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

fn state_topic(agent_id: u32) -> String {
    format!("/agents/{agent_id}/state")
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let interval = parse_duration(&args.interval)?;
    if args.agents == 0 {
        return Err(CliError::new(USAGE, "--agents must be at least 1"));
    }

    let server = ActionServer::bind(
        &Endpoint::new(args.host.clone(), args.command_port),
        ActionServerConfig::default(),
    )
    .map_err(|err| bridge_error("action server bind failed", err))?;
    let publisher = Arc::new(
        TelemetryPublisher::bind(&Endpoint::new(args.host.clone(), args.telemetry_port))
            .map_err(|err| bridge_error("telemetry publisher bind failed", err))?,
    );
    let world = Arc::new(World::new(args.agents));
    info!(
        command = %server.endpoint(),
        telemetry = %publisher.endpoint(),
        agents = args.agents,
        "environment ready"
    );

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), None)?;

    let stop = Arc::new(AtomicBool::new(false));
    let serving = {
        let stop = Arc::clone(&stop);
        let world = Arc::clone(&world);
        let publisher = Arc::clone(&publisher);
        thread::spawn(move || {
            server.serve(&stop, |request| {
                let state = world.apply(request)?;
                debug!(agent_id = state.agent_id, action = %request.action, "applied");
                if let Err(err) = publisher.publish(&state_topic(state.agent_id), &state) {
                    warn!(error = %err, "state publish failed");
                }
                Ok(())
            })
        })
    };

    while running.load(Ordering::SeqCst) && !serving.is_finished() {
        for state in world.snapshot() {
            if let Err(err) = publisher.publish(&state_topic(state.agent_id), &state) {
                warn!(error = %err, "state publish failed");
            }
        }
        let next = Instant::now() + interval;
        while running.load(Ordering::SeqCst) && Instant::now() < next {
            thread::sleep(SLEEP_SLICE.min(next.saturating_duration_since(Instant::now())));
        }
    }

    stop.store(true, Ordering::SeqCst);
    match serving.join() {
        Ok(Ok(())) => {
            info!("environment stopped");
            Ok(SUCCESS)
        }
        Ok(Err(err)) => Err(bridge_error("action server failed", err)),
        Err(_) => Err(CliError::new(INTERNAL, "action server thread panicked")),
    }
}
