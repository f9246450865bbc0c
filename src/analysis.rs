use crate::model::Frame;
use crate::stats::{Accumulator, AccumulatorReport};
use anyhow::{Context, Result};
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufRead, BufReader, BufWriter, Write},
    path::Path,
};

/// Result of a single observable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Report {
    /// Statistics of the susceptible, infected and recovered fractions.
    ProbStatus(Vec<AccumulatorReport>),
    /// Largest number of infected agents and the time it was reached.
    PeakInfected { count: usize, time: u64 },
    /// First saved time without infected agents, if any.
    ExtinctionTime(Option<u64>),
}

pub trait Obs {
    fn update(&mut self, frame: &Frame) -> Result<()>;
    fn report(&self) -> Report;
}

#[derive(Default)]
pub struct ProbStatus {
    acc_vec: [Accumulator; 3],
}

impl Obs for ProbStatus {
    fn update(&mut self, frame: &Frame) -> Result<()> {
        let total = frame.counts.total();
        if total == 0 {
            return Ok(());
        }
        let counts = [frame.counts.s, frame.counts.i, frame.counts.r];
        for (acc, count) in self.acc_vec.iter_mut().zip(counts) {
            acc.add(count as f64 / total as f64);
        }
        Ok(())
    }

    fn report(&self) -> Report {
        Report::ProbStatus(self.acc_vec.iter().map(Accumulator::report).collect())
    }
}

#[derive(Default)]
pub struct PeakInfected {
    count: usize,
    time: u64,
}

impl Obs for PeakInfected {
    fn update(&mut self, frame: &Frame) -> Result<()> {
        if frame.counts.i > self.count {
            self.count = frame.counts.i;
            self.time = frame.time;
        }
        Ok(())
    }

    fn report(&self) -> Report {
        Report::PeakInfected {
            count: self.count,
            time: self.time,
        }
    }
}

#[derive(Default)]
pub struct ExtinctionTime {
    time: Option<u64>,
}

impl Obs for ExtinctionTime {
    fn update(&mut self, frame: &Frame) -> Result<()> {
        if self.time.is_none() && frame.counts.i == 0 {
            self.time = Some(frame.time);
        }
        Ok(())
    }

    fn report(&self) -> Report {
        Report::ExtinctionTime(self.time)
    }
}

pub struct Analyzer {
    n_frames: usize,
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        let obs_ptr_vec: Vec<Box<dyn Obs>> = vec![
            Box::new(ProbStatus::default()),
            Box::new(PeakInfected::default()),
            Box::new(ExtinctionTime::default()),
        ];
        Self {
            n_frames: 0,
            obs_ptr_vec,
        }
    }

    pub fn add_frame(&mut self, frame: &Frame) -> Result<()> {
        self.n_frames += 1;
        for obs in &mut self.obs_ptr_vec {
            obs.update(frame).context("failed to update observable")?;
        }
        Ok(())
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);

        // Files may hold different numbers of frames if the output
        // parameters changed between resumes.
        while !reader.fill_buf().context("failed to read file")?.is_empty() {
            let frame: Frame = decode::from_read(&mut reader).context("failed to read frame")?;
            self.add_frame(&frame)?;
        }
        Ok(())
    }

    /// Number of frames analyzed so far.
    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    pub fn reports(&self) -> Vec<Report> {
        self.obs_ptr_vec.iter().map(|obs| obs.report()).collect()
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        encode::write(&mut writer, &self.reports()).context("failed to serialize reports")?;
        writer.flush().context("failed to flush writer stream")?;
        Ok(())
    }
}
