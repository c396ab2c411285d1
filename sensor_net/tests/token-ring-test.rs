use sensor_net::cluster::NodeConfig;
use sensor_net::testkit::{logging, FailureConfig, FailureConfigMap, LocalCluster, LogLevel};
use sensor_net::testkit::MemoryNetwork;
use std::time::Duration;
use tokio::time::sleep;

fn ms(x: u64) -> Duration {
  Duration::from_millis(x)
}

#[tokio::test(start_paused = true)]
async fn token_moves_to_successor_after_use() {
  logging::init(LogLevel::Warn);
  let config = NodeConfig {
    token_hold: None,
    ..NodeConfig::default()
  };
  let mut cluster = LocalCluster::start(vec![1, 2, 3], config);
  let one = cluster.node(1).unwrap().clone();
  let two = cluster.node(2).unwrap().clone();
  let three = cluster.node(3).unwrap().clone();
  assert!(one.has_token());

  let reading = one.use_token_then_pass(ms(1000)).await.unwrap();
  assert_eq!(reading.source, 1);
  assert_eq!(reading.seq, 1);
  assert!(!one.has_token());
  two.wait_until(ms(1000), |s| s.has_token).await.unwrap();
  assert!(!one.has_token());
  assert!(!three.has_token());

  for node in [&two, &three] {
    node.wait_until(ms(1000), |s| s.readings_received == 1).await.unwrap();
  }
  assert_eq!(cluster.log.events_by_kind("token_passed").len(), 1);
  assert_eq!(cluster.log.events_by_kind("data_sent").len(), 1);
  cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn restarted_first_holder_gets_no_new_token() {
  logging::init(LogLevel::Warn);
  let config = NodeConfig {
    token_hold: None,
    ..NodeConfig::default()
  };
  let mut cluster = LocalCluster::start(vec![1, 2, 3], config);
  cluster.node(1).unwrap().use_token_then_pass(ms(1000)).await.unwrap();
  let two = cluster.node(2).unwrap().clone();
  two.wait_until(ms(1000), |s| s.has_token).await.unwrap();

  cluster.crash(1).await;
  cluster.restart(1);
  sleep(ms(1000)).await;
  let holders = cluster
    .handles()
    .filter(|h| h.has_token())
    .map(|h| h.id())
    .collect::<Vec<_>>();
  assert_eq!(holders, vec![2]);

  // The one token still goes round, through the new incarnation too.
  two.use_token_then_pass(ms(1000)).await.unwrap();
  let three = cluster.node(3).unwrap().clone();
  three.use_token_then_pass(ms(1000)).await.unwrap();
  let one = cluster.node(1).unwrap().clone();
  let reading = one.use_token_then_pass(ms(1000)).await.unwrap();
  assert_eq!(reading.source, 1);
  assert!(!one.has_token());
  cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn waiting_without_token_times_out() {
  let config = NodeConfig {
    token_hold: None,
    ..NodeConfig::default()
  };
  let mut cluster = LocalCluster::start(vec![1, 2], config);
  let two = cluster.node(2).unwrap().clone();
  let err = two.use_token_then_pass(ms(500)).await.unwrap_err();
  assert!(matches!(err, sensor_net::cluster::NodeError::TokenTimeout(_)));
  assert!(two.send_data().await.is_err());
  assert_eq!(two.status().readings_sent, 0);
  cluster.stop_all().await;
}

#[tokio::test(start_paused = true)]
async fn at_most_one_holder_under_delays() {
  logging::init(LogLevel::Warn);
  let net = MemoryNetwork::with_failures(FailureConfigMap::new(FailureConfig::delayed(
    ms(5),
    ms(40),
  )));
  let config = NodeConfig {
    token_hold: Some(ms(20)),
    token_poll_interval: ms(10),
    ..NodeConfig::default()
  };
  let ids = vec![1u64, 2, 3, 4];
  let mut cluster = LocalCluster::start_on(net, ids.clone(), config);
  let handles = cluster.handles().cloned().collect::<Vec<_>>();

  let mut writers = vec![];
  for handle in handles.iter().cloned() {
    writers.push(tokio::spawn(async move {
      for _ in 0..5 {
        handle.use_token_then_pass(ms(10_000)).await.unwrap();
      }
    }));
  }
  let watcher = {
    let handles = handles.clone();
    tokio::spawn(async move {
      for _ in 0..2000 {
        let holders = handles.iter().filter(|h| h.has_token()).count();
        assert!(holders <= 1, "{} nodes hold the token", holders);
        sleep(ms(1)).await;
      }
    })
  };
  for writer in writers {
    writer.await.unwrap();
  }
  watcher.await.unwrap();

  for handle in handles.iter() {
    let expected = 5 * (ids.len() as u64 - 1);
    let status = handle
      .wait_until(ms(1000), |s| s.readings_received == expected)
      .await
      .unwrap();
    assert_eq!(status.readings_sent, 5);
  }
  cluster.stop_all().await;
}
