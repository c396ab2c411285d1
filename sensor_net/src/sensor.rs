//! Simulated climate readings, the payload a node may only multicast while it holds the token.

use crate::core::NodeId;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
  pub source: NodeId,
  /// Starts at 1 and grows by one per reading taken by `source`.
  pub seq: u64,
  /// Degrees Celsius, 15.0 to 35.0.
  pub temperature: f64,
  /// Percent, 30.0 to 80.0.
  pub humidity: f64,
  /// Hectopascals, 990.0 to 1020.0.
  pub pressure: f64,
}

pub struct SensorSimulator {
  source: NodeId,
  seq: u64,
  rng: SmallRng,
}
impl SensorSimulator {
  pub fn new(source: NodeId) -> SensorSimulator {
    SensorSimulator {
      source: source,
      seq: 0,
      rng: SmallRng::from_entropy(),
    }
  }

  pub fn with_seed(source: NodeId, seed: u64) -> SensorSimulator {
    SensorSimulator {
      source: source,
      seq: 0,
      rng: SmallRng::seed_from_u64(seed),
    }
  }

  pub fn sample(&mut self) -> Reading {
    self.seq += 1;
    Reading {
      source: self.source,
      seq: self.seq,
      temperature: round1(self.rng.gen_range(15.0..=35.0)),
      humidity: round1(self.rng.gen_range(30.0..=80.0)),
      pressure: round1(self.rng.gen_range(990.0..=1020.0)),
    }
  }

  /// How many readings have been taken so far.
  pub fn taken(&self) -> u64 {
    self.seq
  }
}

fn round1(x: f64) -> f64 {
  (x * 10.0).round() / 10.0
}

#[test]
fn test_readings_in_range() {
  let mut sim = SensorSimulator::with_seed(4, 17);
  for expected_seq in 1..=200 {
    let r = sim.sample();
    assert_eq!(r.source, 4);
    assert_eq!(r.seq, expected_seq);
    assert!((15.0..=35.0).contains(&r.temperature));
    assert!((30.0..=80.0).contains(&r.humidity));
    assert!((990.0..=1020.0).contains(&r.pressure));
    assert!(((r.temperature * 10.0).round() - r.temperature * 10.0).abs() < 1e-6);
  }
  assert_eq!(sim.taken(), 200);
}
