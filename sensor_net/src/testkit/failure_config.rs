use crate::core::NodeId;
use im::HashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How unreliable the channels into a node are.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug, PartialEq)]
pub struct FailureConfig {
  /// Probability that a message is silently dropped.
  pub drop_prob: f64,
  /// Each delivered message is held back for a uniform random time in this range. Messages on the
  /// same channel still arrive in the order they were sent.
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn reliable() -> FailureConfig {
    FailureConfig::default()
  }

  pub fn dropping(drop_prob: f64) -> FailureConfig {
    FailureConfig {
      drop_prob: drop_prob,
      delay: None,
    }
  }

  pub fn delayed(min: Duration, max: Duration) -> FailureConfig {
    FailureConfig {
      drop_prob: 0.0,
      delay: Some((min, max)),
    }
  }

  pub fn should_drop<R: Rng>(&self, rng: &mut R) -> bool {
    self.drop_prob > 0.0 && rng.gen::<f64>() < self.drop_prob
  }

  pub fn sample_delay<R: Rng>(&self, rng: &mut R) -> Duration {
    match self.delay {
      Some((min, max)) if max > min => {
        let range = min.as_millis()..=max.as_millis();
        Duration::from_millis(rng.gen_range(range) as u64)
      }
      Some((min, _)) => min,
      None => Duration::ZERO,
    }
  }
}

/// A cluster-wide [`FailureConfig`], overridden for the channels into particular nodes.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<NodeId, FailureConfig>,
}
impl FailureConfigMap {
  pub fn new(cluster_wide: FailureConfig) -> FailureConfigMap {
    FailureConfigMap {
      cluster_wide: cluster_wide,
      node_wide: HashMap::new(),
    }
  }

  pub fn with_node(mut self, node: NodeId, cfg: FailureConfig) -> FailureConfigMap {
    self.node_wide.insert(node, cfg);
    self
  }

  pub fn get(&self, node: NodeId) -> &FailureConfig {
    self.node_wide.get(&node).unwrap_or(&self.cluster_wide)
  }
}

#[test]
fn test_failure_config_lookup() {
  use rand::rngs::SmallRng;
  use rand::SeedableRng;

  let ms = Duration::from_millis;
  let map = FailureConfigMap::new(FailureConfig::delayed(ms(10), ms(20)))
    .with_node(3, FailureConfig::dropping(1.0));
  let mut rng = SmallRng::seed_from_u64(7);
  assert!(map.get(3).should_drop(&mut rng));
  assert!(!map.get(1).should_drop(&mut rng));
  for _ in 0..100 {
    let d = map.get(2).sample_delay(&mut rng);
    assert!(d >= ms(10) && d <= ms(20));
  }
  assert_eq!(FailureConfig::reliable().sample_delay(&mut rng), Duration::ZERO);
}
