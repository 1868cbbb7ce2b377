//! Authoritative instance records and their scripted lifecycles
//!
//! Each instance follows a [`Scenario`]: a timeline of status changes, flag
//! changes and console lines keyed by agent tick. The agent advances every
//! timeline once per tick and pushes the resulting events to attached
//! monitors.

use log::info;
use rand::Rng;
use shared::{get_timestamp, InstanceSnapshot, InstanceStatus};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("unknown scenario {0:?}")]
    UnknownScenario(String),
    #[error("instance argument {0:?} is not of the form key=scenario")]
    InvalidInstanceArg(String),
    #[error("instance not found")]
    InstanceNotFound(String),
    #[error("{0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    Steady,
    Install,
    InstallFailed,
    Suspended,
    Transfer,
    Maintenance,
    Restore,
    PidLimit,
}

impl FromStr for Scenario {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steady" => Ok(Scenario::Steady),
            "install" => Ok(Scenario::Install),
            "install-failed" => Ok(Scenario::InstallFailed),
            "suspended" => Ok(Scenario::Suspended),
            "transfer" => Ok(Scenario::Transfer),
            "maintenance" => Ok(Scenario::Maintenance),
            "restore" => Ok(Scenario::Restore),
            "pid-limit" => Ok(Scenario::PidLimit),
            other => Err(AgentError::UnknownScenario(other.to_string())),
        }
    }
}

/// Parses `key=scenario` as given on the command line.
pub fn parse_instance_arg(arg: &str) -> Result<(String, Scenario), AgentError> {
    let (key, scenario) = arg
        .split_once('=')
        .ok_or_else(|| AgentError::InvalidInstanceArg(arg.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(AgentError::InvalidInstanceArg(arg.to_string()));
    }
    Ok((key.to_string(), scenario.trim().parse()?))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Status(InstanceStatus),
    Console(&'static str),
    Transferring(bool),
    Maintenance(bool),
}

/// Something monitors attached to the instance must hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    StatusChanged(InstanceStatus),
    ConsoleOutput(String),
}

const FILLER_LINES: [&str; 4] = [
    "[Server thread/INFO]: Saving chunks for level 'world'",
    "[Server thread/INFO]: ThreadedAnvilChunkStorage: All chunks are saved",
    "[Server thread/INFO]: Player count: 0",
    "[Server thread/INFO]: Autosave complete",
];

fn install_steps(outcome: InstanceStatus) -> Vec<(u32, Step)> {
    let mut steps = vec![
        (2, Step::Console("container@panel~ Installing dependencies...")),
        (10, Step::Console("container@panel~ Downloading server files...")),
        (20, Step::Console("container@panel~ Running install script...")),
    ];
    if outcome.is_running() {
        steps.extend([
            (30, Step::Status(InstanceStatus::Offline)),
            (32, Step::Status(InstanceStatus::Starting)),
            (34, Step::Console("[Server thread/INFO]: Starting server")),
            (40, Step::Status(InstanceStatus::Running)),
        ]);
    } else {
        steps.extend([
            (28, Step::Console("container@panel~ Install script exited with code 1")),
            (30, Step::Status(outcome)),
        ]);
    }
    steps
}

fn scenario_start(scenario: Scenario) -> (InstanceStatus, bool, bool, Vec<(u32, Step)>) {
    match scenario {
        Scenario::Steady => (InstanceStatus::Running, false, false, Vec::new()),
        Scenario::Install => (
            InstanceStatus::Installing,
            false,
            false,
            install_steps(InstanceStatus::Running),
        ),
        Scenario::InstallFailed => (
            InstanceStatus::Installing,
            false,
            false,
            install_steps(InstanceStatus::InstallFailed),
        ),
        Scenario::Suspended => (InstanceStatus::Suspended, false, false, Vec::new()),
        Scenario::Transfer => (
            InstanceStatus::Offline,
            true,
            false,
            vec![
                (50, Step::Transferring(false)),
                (51, Step::Status(InstanceStatus::Starting)),
                (60, Step::Status(InstanceStatus::Running)),
            ],
        ),
        Scenario::Maintenance => (
            InstanceStatus::Running,
            false,
            true,
            vec![(100, Step::Maintenance(false))],
        ),
        Scenario::Restore => (
            InstanceStatus::RestoringBackup,
            false,
            false,
            vec![
                (40, Step::Status(InstanceStatus::Offline)),
                (45, Step::Status(InstanceStatus::Starting)),
                (55, Step::Status(InstanceStatus::Running)),
            ],
        ),
        Scenario::PidLimit => (
            InstanceStatus::Offline,
            false,
            false,
            vec![
                (5, Step::Status(InstanceStatus::Starting)),
                (8, Step::Console("[Server thread/INFO]: Loading libraries, please wait...")),
                (
                    20,
                    Step::Console(
                        "[Server thread/ERROR]: java.lang.OutOfMemoryError: unable to create new native thread",
                    ),
                ),
                (22, Step::Console("[Worker-Main-3/ERROR]: pthread_create failed (EAGAIN)")),
                (30, Step::Status(InstanceStatus::Offline)),
            ],
        ),
    }
}

pub struct Instance {
    key: String,
    scenario: Scenario,
    status: InstanceStatus,
    is_transferring: bool,
    is_node_under_maintenance: bool,
    last_updated: u64,
    ticks: u32,
    timeline: VecDeque<(u32, Step)>,
}

impl Instance {
    pub fn new(key: impl Into<String>, scenario: Scenario) -> Self {
        let (status, is_transferring, is_node_under_maintenance, steps) = scenario_start(scenario);
        let mut instance = Self {
            key: key.into(),
            scenario,
            status,
            is_transferring,
            is_node_under_maintenance,
            last_updated: get_timestamp(),
            ticks: 0,
            timeline: VecDeque::new(),
        };
        instance.schedule(steps);
        instance
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> &InstanceStatus {
        &self.status
    }

    pub fn is_idle(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            instance_key: self.key.clone(),
            status: self.status.clone(),
            is_transferring: self.is_transferring,
            is_node_under_maintenance: self.is_node_under_maintenance,
            last_updated: self.last_updated,
        }
    }

    /// Queues `steps`, offset from the current tick.
    fn schedule(&mut self, steps: Vec<(u32, Step)>) {
        let now = self.ticks;
        self.timeline.clear();
        self.timeline
            .extend(steps.into_iter().map(|(at, step)| (now + at, step)));
    }

    fn set_status(&mut self, status: InstanceStatus) -> Option<InstanceEvent> {
        if self.status == status {
            return None;
        }
        info!("Instance {}: {} -> {}", self.key, self.status, status);
        self.status = status.clone();
        self.last_updated = get_timestamp();
        Some(InstanceEvent::StatusChanged(status))
    }

    /// Runs one tick of the timeline.
    pub fn advance<R: Rng>(&mut self, rng: &mut R) -> Vec<InstanceEvent> {
        self.ticks += 1;
        let mut events = Vec::new();

        while matches!(self.timeline.front(), Some((at, _)) if *at <= self.ticks) {
            let Some((_, step)) = self.timeline.pop_front() else {
                break;
            };
            match step {
                Step::Status(status) => events.extend(self.set_status(status)),
                Step::Console(line) => events.push(InstanceEvent::ConsoleOutput(line.to_string())),
                Step::Transferring(value) => {
                    self.is_transferring = value;
                    self.last_updated = get_timestamp();
                }
                Step::Maintenance(value) => {
                    self.is_node_under_maintenance = value;
                    self.last_updated = get_timestamp();
                }
            }
        }

        if self.status.is_running() && self.timeline.is_empty() && rng.gen_bool(0.02) {
            let line = FILLER_LINES[rng.gen_range(0..FILLER_LINES.len())];
            events.push(InstanceEvent::ConsoleOutput(line.to_string()));
        }

        events
    }

    /// Restarts the install script. Refused while the instance is not in a
    /// state the panel would allow a reinstall from. An instance whose
    /// install script is broken fails again with `reinstall_failed`.
    pub fn reinstall(&mut self) -> Result<Vec<InstanceEvent>, AgentError> {
        if self.status == InstanceStatus::Suspended {
            return Err(AgentError::Conflict("instance is suspended".to_string()));
        }
        if self.is_transferring || self.is_node_under_maintenance {
            return Err(AgentError::Conflict(
                "instance is transferring or its node is under maintenance".to_string(),
            ));
        }
        if self.status == InstanceStatus::Installing || self.status == InstanceStatus::RestoringBackup {
            return Err(AgentError::Conflict(format!(
                "instance is busy ({})",
                self.status
            )));
        }

        let outcome = match self.scenario {
            Scenario::InstallFailed => InstanceStatus::ReinstallFailed,
            _ => InstanceStatus::Running,
        };
        self.schedule(install_steps(outcome));
        Ok(self
            .set_status(InstanceStatus::Installing)
            .into_iter()
            .collect())
    }
}

/// All instances hosted by this agent.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: HashMap<String, Instance>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, scenario: Scenario) {
        let key = key.into();
        info!("Hosting instance {} ({:?})", key, scenario);
        self.instances.insert(key.clone(), Instance::new(key, scenario));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.instances.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Instance> {
        self.instances.get(key)
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn snapshot(&self, key: &str) -> Result<InstanceSnapshot, AgentError> {
        self.instances
            .get(key)
            .map(Instance::snapshot)
            .ok_or_else(|| AgentError::InstanceNotFound(key.to_string()))
    }

    pub fn reinstall(&mut self, key: &str) -> Result<Vec<InstanceEvent>, AgentError> {
        self.instances
            .get_mut(key)
            .ok_or_else(|| AgentError::InstanceNotFound(key.to_string()))?
            .reinstall()
    }

    /// Advances every instance by one tick.
    pub fn advance_all<R: Rng>(&mut self, rng: &mut R) -> Vec<(String, InstanceEvent)> {
        let mut events = Vec::new();
        for (key, instance) in self.instances.iter_mut() {
            for event in instance.advance(rng) {
                events.push((key.clone(), event));
            }
        }
        events
    }
}
