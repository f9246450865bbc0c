use crate::config::{InitParams, ModelParams, OutputParams};
use crate::model::{Agent, Counts, Frame, History, Status};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Uniform;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    f64::consts::TAU,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Time increment of a single step.
const DT: f64 = 1.0;

/// Speed factor applied to agents during lockdown.
pub const LOCKDOWN_FACTOR: f64 = 0.2;

/// Simulation engine.
///
/// Holds the model parameters, the agents, the random number generator,
/// the current time and the recorded history, and provides methods to
/// initialize, step, run, save, and load simulations.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    /// Model parameters, which may be changed between steps.
    pub params: ModelParams,
    agt_vec: Vec<Agent>,
    rng: ChaCha12Rng,
    time: u64,
    history: History,
}

impl Engine {
    /// Create a new `Engine` with a random initial population.
    ///
    /// The generator is seeded from `init.seed` if present, and from the
    /// operating system otherwise.
    pub fn new(params: ModelParams, init: &InitParams) -> Result<Self> {
        init.validate().context("invalid initialization parameters")?;

        let rng = match init.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        Self::with_rng(params, init.population, rng)
    }

    /// Create a new `Engine` drawing every random number from `rng`.
    pub fn with_rng(params: ModelParams, population: usize, rng: ChaCha12Rng) -> Result<Self> {
        params.validate().context("invalid model parameters")?;
        if population == 0 {
            bail!("population must be at least 1");
        }

        let mut engine = Self {
            params,
            agt_vec: Vec::with_capacity(population),
            rng,
            time: 0,
            history: History::default(),
        };
        engine
            .init_agents(population)
            .context("failed to initialize agents")?;

        Ok(engine)
    }

    /// Rebuild the population with the current parameters.
    ///
    /// The population size is kept, time goes back to zero and the history
    /// is discarded.
    pub fn reset(&mut self) -> Result<()> {
        self.params.validate().context("invalid model parameters")?;
        let population = self.agt_vec.len();
        self.init_agents(population)
            .context("failed to initialize agents")
    }

    fn init_agents(&mut self, population: usize) -> Result<()> {
        let x_dist = Uniform::new_inclusive(0.0, self.params.width)?;
        let y_dist = Uniform::new_inclusive(0.0, self.params.height)?;
        let angle_dist = Uniform::new(0.0, TAU)?;
        let factor_dist = Uniform::new(0.5, 1.0)?;

        let speed = if self.params.lockdown {
            self.params.speed * LOCKDOWN_FACTOR
        } else {
            self.params.speed
        };

        self.agt_vec.clear();
        for _ in 0..population {
            let pos = [x_dist.sample(&mut self.rng), y_dist.sample(&mut self.rng)];
            let angle = angle_dist.sample(&mut self.rng);
            let agt_speed = speed * factor_dist.sample(&mut self.rng);
            let vel = [agt_speed * angle.cos(), agt_speed * angle.sin()];
            self.agt_vec.push(Agent::new(pos, vel, Status::Susceptible));
        }

        // Vaccinated agents start immune.
        for agt in &mut self.agt_vec {
            if self.rng.random::<f64>() < self.params.vacc_percent {
                *agt = Agent::new(agt.pos(), agt.vel(), Status::Recovered);
            }
        }

        let i_agt_sus: Vec<_> = (0..population)
            .filter(|&i_agt| self.agt_vec[i_agt].status() == Status::Susceptible)
            .collect();
        match i_agt_sus.choose(&mut self.rng) {
            Some(&i_agt) => {
                self.agt_vec[i_agt].infect();
                log::debug!("seeded patient zero {i_agt}");
            }
            None => log::debug!("no susceptible agents, nothing to seed"),
        }

        self.time = 0;
        self.history = History::default();
        self.record();

        Ok(())
    }

    /// Advance the simulation by one step.
    pub fn step(&mut self) {
        let bounds = (self.params.width, self.params.height);
        for agt in &mut self.agt_vec {
            agt.advance(DT, bounds);
        }

        self.transmit();

        let recovery_time = self.params.recovery_time;
        for agt in &mut self.agt_vec {
            agt.progress(recovery_time);
        }

        self.record();
        self.time += 1;
    }

    /// Advance the simulation by `steps` steps and return the history.
    pub fn run(&mut self, steps: usize) -> &History {
        for _ in 0..steps {
            self.step();
        }
        &self.history
    }

    fn transmit(&mut self) {
        let snapshot: Vec<_> = self.agt_vec.iter().map(Agent::status).collect();
        let radius_2 = self.params.infection_radius * self.params.infection_radius;
        let prob = self.params.infection_prob;

        // Infections only take effect once every pair has been tried, so an
        // agent infected this step neither spreads nor is spread to twice.
        let mut infected = vec![false; self.agt_vec.len()];
        for (src, _) in snapshot
            .iter()
            .enumerate()
            .filter(|&(_, &status)| status == Status::Infected)
        {
            for (tgt, _) in snapshot
                .iter()
                .enumerate()
                .filter(|&(_, &status)| status == Status::Susceptible)
            {
                if self.agt_vec[src].dist_2(&self.agt_vec[tgt]) <= radius_2
                    && self.rng.random::<f64>() < prob
                {
                    infected[tgt] = true;
                }
            }
        }

        for (agt, _) in self.agt_vec.iter_mut().zip(infected).filter(|(_, inf)| *inf) {
            agt.infect();
        }
    }

    fn record(&mut self) {
        self.history.push(Counts::tally(&self.agt_vec));
    }

    /// Set the lockdown flag and rescale the velocities of existing agents.
    ///
    /// Entering lockdown slows every agent down by [`LOCKDOWN_FACTOR`] and
    /// leaving it undoes the slowdown. Writing `params.lockdown` directly
    /// only affects agents created by a later reset.
    pub fn apply_lockdown(&mut self, lockdown: bool) {
        if lockdown == self.params.lockdown {
            return;
        }
        self.params.lockdown = lockdown;
        let factor = if lockdown {
            LOCKDOWN_FACTOR
        } else {
            LOCKDOWN_FACTOR.recip()
        };
        self.scale_velocities(factor);
        log::info!("lockdown {}", if lockdown { "on" } else { "off" });
    }

    /// Multiply the velocity of every agent by `factor`.
    pub fn scale_velocities(&mut self, factor: f64) {
        for agt in &mut self.agt_vec {
            agt.scale_vel(factor);
        }
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agt_vec
    }

    pub fn population(&self) -> usize {
        self.agt_vec.len()
    }

    pub fn time(&self) -> u64 {
        self.time
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    /// Current compartment counts.
    pub fn counts(&self) -> Counts {
        Counts::tally(&self.agt_vec)
    }

    fn frame(&self) -> Frame {
        Frame {
            time: self.time,
            counts: self.counts(),
            agt_vec: self.agt_vec.clone(),
        }
    }

    /// Perform the simulation and save the resulting frames to a binary file.
    pub fn perform_simulation<P: AsRef<Path>>(
        &mut self,
        output: &OutputParams,
        file: P,
    ) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        for i_save in 0..output.saves_per_file {
            self.run(output.steps_per_save);

            encode::write(&mut writer, &self.frame()).context("failed to serialize frame")?;

            let progress = 100.0 * (i_save + 1) as f64 / output.saves_per_file as f64;
            log::info!("completed {progress:06.2}%");
        }

        writer.flush().context("failed to flush writer stream")?;

        let counts = self.counts();
        log::info!(
            "time {}: S = {}, I = {}, R = {}",
            self.time,
            counts.s,
            counts.i,
            counts.r
        );

        Ok(())
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize engine")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }

    #[cfg(test)]
    fn from_agents(params: ModelParams, agt_vec: Vec<Agent>, seed: u64) -> Self {
        let mut engine = Self {
            params,
            agt_vec,
            rng: ChaCha12Rng::seed_from_u64(seed),
            time: 0,
            history: History::default(),
        };
        engine.record();
        engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> ModelParams {
        ModelParams {
            width: 40.0,
            height: 30.0,
            infection_radius: 3.0,
            infection_prob: 0.4,
            recovery_time: 12,
            vacc_percent: 0.2,
            speed: 1.0,
            lockdown: false,
        }
    }

    fn init(population: usize, seed: u64) -> InitParams {
        InitParams {
            population,
            seed: Some(seed),
        }
    }

    fn still_params() -> ModelParams {
        ModelParams {
            infection_radius: 1.0,
            infection_prob: 1.0,
            recovery_time: 10,
            speed: 0.0,
            ..ModelParams::default()
        }
    }

    fn still(x: f64, status: Status) -> Agent {
        if status == Status::Infected {
            let mut agt = Agent::new([x, 50.0], [0.0, 0.0], Status::Susceptible);
            agt.infect();
            return agt;
        }
        Agent::new([x, 50.0], [0.0, 0.0], status)
    }

    #[test]
    fn seeds_exactly_one_patient_zero() {
        let engine = Engine::new(params(), &init(100, 1)).unwrap();
        let counts = engine.counts();
        assert_eq!(counts.i, 1);
        assert_eq!(engine.time(), 0);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.history().get(0), Some(counts));

        let agt = engine
            .agents()
            .iter()
            .find(|agt| agt.status() == Status::Infected)
            .unwrap();
        assert_eq!(agt.inf_dur(), 0);
    }

    #[test]
    fn initial_agents_inside_arena_with_bounded_speed() {
        let mut p = params();
        p.speed = 2.0;
        p.lockdown = true;
        let engine = Engine::new(p.clone(), &init(200, 5)).unwrap();
        for agt in engine.agents() {
            let [x, y] = agt.pos();
            assert!((0.0..=p.width).contains(&x));
            assert!((0.0..=p.height).contains(&y));
            let speed = agt.vel()[0].hypot(agt.vel()[1]);
            let max = p.speed * LOCKDOWN_FACTOR;
            assert!(speed >= 0.5 * max - 1e-12 && speed <= max + 1e-12, "speed = {speed}");
        }
    }

    #[test]
    fn rejects_invalid_construction() {
        assert!(Engine::new(params(), &init(0, 1)).is_err());
        for p in [
            ModelParams { width: 0.0, ..params() },
            ModelParams { height: -5.0, ..params() },
            ModelParams { infection_prob: 1.01, ..params() },
            ModelParams { vacc_percent: 2.0, ..params() },
            ModelParams { recovery_time: 0, ..params() },
        ] {
            assert!(Engine::new(p, &init(10, 1)).is_err());
        }
    }

    #[test]
    fn counts_always_sum_to_population() {
        let mut engine = Engine::new(params(), &init(150, 9)).unwrap();
        let history = engine.run(200);
        assert_eq!(history.len(), 201);
        assert_eq!(history.s.len(), history.i.len());
        assert_eq!(history.i.len(), history.r.len());
        for counts in history.iter() {
            assert_eq!(counts.total(), 150);
        }
        assert_eq!(engine.time(), 200);
    }

    #[test]
    fn status_never_goes_back() {
        let mut engine = Engine::new(params(), &init(120, 11)).unwrap();
        let mut prev: Vec<_> = engine.agents().iter().map(Agent::status).collect();
        for _ in 0..150 {
            engine.step();
            for (agt, &old) in engine.agents().iter().zip(&prev) {
                assert!(agt.status() >= old, "{old:?} -> {:?}", agt.status());
            }
            prev = engine.agents().iter().map(Agent::status).collect();
        }
    }

    #[test]
    fn same_seed_same_trajectory() {
        let mut engine_a = Engine::new(params(), &init(80, 42)).unwrap();
        let mut engine_b = Engine::new(params(), &init(80, 42)).unwrap();
        assert_eq!(engine_a.agents(), engine_b.agents());

        engine_a.run(100);
        engine_b.run(100);
        assert_eq!(engine_a.history(), engine_b.history());
        assert_eq!(engine_a.agents(), engine_b.agents());
    }

    #[test]
    fn split_runs_match_single_run() {
        let mut engine_a = Engine::new(params(), &init(60, 8)).unwrap();
        let mut engine_b = Engine::new(params(), &init(60, 8)).unwrap();

        engine_a.run(10);
        engine_a.run(10);
        engine_b.run(20);

        assert_eq!(engine_a.history().len(), 21);
        assert_eq!(engine_a.history(), engine_b.history());
        assert_eq!(engine_a.agents(), engine_b.agents());
    }

    #[test]
    fn full_vaccination_stays_disease_free() {
        let mut p = params();
        p.vacc_percent = 1.0;
        let mut engine = Engine::new(p, &init(50, 3)).unwrap();
        let history = engine.run(50);
        assert!(history.i.iter().all(|&i| i == 0));
        assert!(history.r.iter().all(|&r| r == 50));
    }

    #[test]
    fn no_chained_infection_within_a_step() {
        let agt_vec = vec![
            still(10.0, Status::Infected),
            still(11.0, Status::Susceptible),
            still(12.0, Status::Susceptible),
        ];
        let mut engine = Engine::from_agents(still_params(), agt_vec, 0);

        engine.step();
        let status: Vec<_> = engine.agents().iter().map(Agent::status).collect();
        assert_eq!(
            status,
            [Status::Infected, Status::Infected, Status::Susceptible]
        );

        engine.step();
        assert_eq!(engine.agents()[2].status(), Status::Infected);
        assert_eq!(engine.agents()[2].inf_dur(), 1);
        assert_eq!(engine.agents()[0].inf_dur(), 2);
    }

    #[test]
    fn draws_once_per_infected_susceptible_pair_in_range() {
        let agt_vec = vec![
            still(10.0, Status::Infected),
            still(10.5, Status::Infected),
            still(11.0, Status::Susceptible),
            still(30.0, Status::Susceptible),
            still(10.8, Status::Recovered),
        ];
        let mut p = still_params();
        p.infection_prob = 0.5;
        let mut engine = Engine::from_agents(p, agt_vec, 17);

        engine.step();

        // Both sources try the in-range target, marked or not. The distant
        // target and the recovered agent never consume a draw.
        let mut reference = ChaCha12Rng::seed_from_u64(17);
        let hits = (0..2).filter(|_| reference.random::<f64>() < 0.5).count();
        assert!(engine.rng == reference);
        assert_eq!(engine.rng.random::<u64>(), reference.random::<u64>());

        let expected = if hits > 0 {
            Status::Infected
        } else {
            Status::Susceptible
        };
        assert_eq!(engine.agents()[2].status(), expected);
        assert_eq!(engine.agents()[3].status(), Status::Susceptible);
    }

    #[test]
    fn infection_clock_starts_in_the_infection_step() {
        let agt_vec = vec![
            still(10.0, Status::Infected),
            still(10.5, Status::Susceptible),
        ];
        let mut p = still_params();
        p.recovery_time = 1;
        let mut engine = Engine::from_agents(p, agt_vec, 0);

        engine.step();

        for agt in engine.agents() {
            assert_eq!(agt.status(), Status::Recovered);
            assert_eq!(agt.inf_dur(), 1);
        }
        assert_eq!(engine.history().get(1), Some(Counts { s: 0, i: 0, r: 2 }));
    }

    #[test]
    fn unseeded_engine_keeps_population() {
        let init = InitParams {
            population: 60,
            seed: None,
        };
        let mut engine = Engine::new(params(), &init).unwrap();
        assert_eq!(engine.counts().i, 1);

        let history = engine.run(40);
        assert_eq!(history.len(), 41);
        for counts in history.iter() {
            assert_eq!(counts.total(), 60);
        }
    }

    #[test]
    fn recovered_agents_are_not_infected() {
        let agt_vec = vec![still(10.0, Status::Infected), still(10.5, Status::Recovered)];
        let mut engine = Engine::from_agents(still_params(), agt_vec, 0);
        engine.run(5);
        assert_eq!(engine.agents()[1].status(), Status::Recovered);
    }

    #[test]
    fn zero_probability_never_transmits() {
        let mut p = params();
        p.infection_prob = 0.0;
        p.infection_radius = 100.0;
        let mut engine = Engine::new(p, &init(40, 4)).unwrap();
        let history = engine.run(30);
        assert!(history.s.iter().all(|&s| s == history.s[0]));
    }

    #[test]
    fn parameter_changes_apply_to_next_step() {
        let agt_vec = vec![still(10.0, Status::Infected), still(10.5, Status::Susceptible)];
        let mut p = still_params();
        p.infection_prob = 0.0;
        let mut engine = Engine::from_agents(p, agt_vec, 0);

        engine.step();
        assert_eq!(engine.agents()[1].status(), Status::Susceptible);

        engine.params.infection_prob = 1.0;
        engine.step();
        assert_eq!(engine.agents()[1].status(), Status::Infected);

        engine.params.recovery_time = 3;
        engine.step();
        assert_eq!(engine.agents()[0].status(), Status::Recovered);
    }

    #[test]
    fn lockdown_flag_alone_keeps_velocities() {
        let mut engine = Engine::new(params(), &init(20, 6)).unwrap();
        let before: Vec<_> = engine.agents().iter().map(Agent::vel).collect();

        engine.params.lockdown = true;
        let after: Vec<_> = engine.agents().iter().map(Agent::vel).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn apply_lockdown_rescales_velocities() {
        let mut engine = Engine::new(params(), &init(20, 6)).unwrap();
        let before: Vec<_> = engine.agents().iter().map(Agent::vel).collect();

        engine.apply_lockdown(true);
        assert!(engine.params.lockdown);
        for (agt, vel) in engine.agents().iter().zip(&before) {
            assert!((agt.vel()[0] - vel[0] * LOCKDOWN_FACTOR).abs() < 1e-12);
            assert!((agt.vel()[1] - vel[1] * LOCKDOWN_FACTOR).abs() < 1e-12);
        }

        engine.apply_lockdown(true);
        engine.apply_lockdown(false);
        for (agt, vel) in engine.agents().iter().zip(&before) {
            assert!((agt.vel()[0] - vel[0]).abs() < 1e-9);
            assert!((agt.vel()[1] - vel[1]).abs() < 1e-9);
        }
    }

    #[test]
    fn reset_restarts_time_and_history() {
        let mut engine = Engine::new(params(), &init(30, 2)).unwrap();
        engine.run(25);

        engine.params.vacc_percent = 1.0;
        engine.reset().unwrap();
        assert_eq!(engine.time(), 0);
        assert_eq!(engine.population(), 30);
        assert_eq!(engine.history().len(), 1);
        assert_eq!(engine.counts().r, 30);
    }

    #[test]
    fn checkpoint_resumes_identically() {
        let dir = std::env::temp_dir().join(format!("episim-checkpoint-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("checkpoint.msgpack");

        let mut engine = Engine::new(params(), &init(50, 21)).unwrap();
        engine.run(15);
        engine.save_checkpoint(&file).unwrap();
        let mut loaded = Engine::load_checkpoint(&file).unwrap();

        engine.run(15);
        loaded.run(15);
        assert_eq!(engine.history(), loaded.history());
        assert_eq!(engine.agents(), loaded.agents());
        assert_eq!(loaded.time(), 30);

        std::fs::remove_dir_all(&dir).ok();
    }
}
