//! Simulation data types.

use serde::{Deserialize, Serialize};

/// Health status of an agent.
///
/// Ordered by transition legality: an agent's status never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    Susceptible,
    Infected,
    Recovered,
}

/// Agent of the simulation.
///
/// Each agent has a position and velocity in the arena, a health status,
/// and the number of steps it has been infected (`inf_dur`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pos: [f64; 2],
    vel: [f64; 2],
    status: Status,
    inf_dur: u32,
}

impl Agent {
    /// Create a new agent.
    pub fn new(pos: [f64; 2], vel: [f64; 2], status: Status) -> Self {
        Self {
            pos,
            vel,
            status,
            inf_dur: 0,
        }
    }

    pub fn pos(&self) -> [f64; 2] {
        self.pos
    }

    pub fn vel(&self) -> [f64; 2] {
        self.vel
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// Number of steps spent infected (only meaningful while infected).
    pub fn inf_dur(&self) -> u32 {
        self.inf_dur
    }

    /// Move the agent by `vel * dt` and bounce it off the arena walls.
    ///
    /// Each axis reflects independently. A single reflection per wall is
    /// applied, so the displacement must be smaller than the arena size.
    pub fn advance(&mut self, dt: f64, bounds: (f64, f64)) {
        let bounds = [bounds.0, bounds.1];
        for axis in 0..2 {
            self.pos[axis] += self.vel[axis] * dt;
            if self.pos[axis] < 0.0 {
                self.pos[axis] = -self.pos[axis];
                self.vel[axis] = -self.vel[axis];
            }
            if self.pos[axis] > bounds[axis] {
                self.pos[axis] = 2.0 * bounds[axis] - self.pos[axis];
                self.vel[axis] = -self.vel[axis];
            }
        }
    }

    /// Squared distance to another agent.
    pub fn dist_2(&self, other: &Agent) -> f64 {
        let dx = self.pos[0] - other.pos[0];
        let dy = self.pos[1] - other.pos[1];
        dx * dx + dy * dy
    }

    /// Multiply both velocity components by `factor`.
    pub fn scale_vel(&mut self, factor: f64) {
        self.vel.iter_mut().for_each(|v| *v *= factor);
    }

    /// Transition to infected and restart the infection clock.
    pub fn infect(&mut self) {
        self.status = Status::Infected;
        self.inf_dur = 0;
    }

    /// Advance the infection clock and recover once it reaches `recovery_time`.
    pub fn progress(&mut self, recovery_time: u32) {
        if self.status != Status::Infected {
            return;
        }
        self.inf_dur += 1;
        if self.inf_dur >= recovery_time {
            self.status = Status::Recovered;
        }
    }
}

/// Number of agents in each compartment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub s: usize,
    pub i: usize,
    pub r: usize,
}

impl Counts {
    pub fn tally(agt_vec: &[Agent]) -> Self {
        let mut counts = Self::default();
        for agt in agt_vec {
            match agt.status() {
                Status::Susceptible => counts.s += 1,
                Status::Infected => counts.i += 1,
                Status::Recovered => counts.r += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.s + self.i + self.r
    }
}

/// Compartment counts recorded at every step.
///
/// The three series always have equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    pub s: Vec<usize>,
    pub i: Vec<usize>,
    pub r: Vec<usize>,
}

impl History {
    pub fn push(&mut self, counts: Counts) {
        self.s.push(counts.s);
        self.i.push(counts.i);
        self.r.push(counts.r);
    }

    pub fn len(&self) -> usize {
        self.s.len()
    }

    pub fn is_empty(&self) -> bool {
        self.s.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Counts> {
        Some(Counts {
            s: *self.s.get(idx)?,
            i: *self.i.get(idx)?,
            r: *self.r.get(idx)?,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Counts> + '_ {
        (0..self.len()).filter_map(|idx| self.get(idx))
    }
}

/// Saved state of the simulation at a given time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Simulation time.
    pub time: u64,

    /// Compartment counts at this time.
    pub counts: Counts,

    /// All agents of the simulation.
    pub agt_vec: Vec<Agent>,
}
