use sensor_net::cluster::{ClusterFile, GlobalSnapshot, NodeDeps, SensorNode};
use sensor_net::core::{NodeId, UdpTransport};
use sensor_net::storage::{EventLog, FileCheckpointStore};
use sensor_net::testkit::{logging, LocalCluster, LogLevel};
use std::env::args;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const USAGE: &str = "usage: simulation [nodes] [rounds]\n       simulation udp <cluster.json> <id> <seconds>";

fn arg<T: std::str::FromStr>(args: &[String], idx: usize, default: T) -> T {
  match args.get(idx) {
    Some(s) => s.parse().unwrap_or_else(|_| {
      eprintln!("bad argument '{}'\n{}", s, USAGE);
      exit(2)
    }),
    None => default,
  }
}

#[tokio::main]
async fn main() {
  logging::init(LogLevel::Info);
  let args = args().skip(1).collect::<Vec<_>>();
  if args.first().map(|s| s.as_str()) == Some("udp") {
    if args.len() < 4 {
      eprintln!("{}", USAGE);
      exit(2);
    }
    let id = arg::<NodeId>(&args, 2, 0);
    let secs = arg::<u64>(&args, 3, 30);
    run_udp(PathBuf::from(&args[1]), id, Duration::from_secs(secs)).await;
  } else {
    let nodes = arg::<u64>(&args, 0, 3).max(2);
    let rounds = arg::<u32>(&args, 1, 5);
    run_local(nodes, rounds).await;
  }
}

async fn run_local(nodes: u64, rounds: u32) {
  let mut cluster = LocalCluster::start(1..=nodes, Default::default());
  if let Err(e) = cluster.await_coordinator(nodes, Duration::from_secs(5)).await {
    error!("no coordinator: {}", e);
    exit(1);
  }
  info!(coordinator = nodes, "cluster is up");

  let handles = cluster.handles().cloned().collect::<Vec<_>>();
  let mut writers = vec![];
  for handle in handles.iter().cloned() {
    writers.push(tokio::spawn(async move {
      for _ in 0..rounds {
        match handle.use_token_then_pass(Duration::from_secs(10)).await {
          Ok(r) => info!(
            node = r.source,
            seq = r.seq,
            "{:.1} C, {:.1} %, {:.1} hPa",
            r.temperature,
            r.humidity,
            r.pressure
          ),
          Err(e) => warn!(node = handle.id(), "gave up on the token: {}", e),
        }
      }
    }));
  }

  tokio::time::sleep(Duration::from_millis(300)).await;
  if let Some(first) = handles.first() {
    let _ = first.start_snapshot().await;
  }
  let mut fragments = vec![];
  for handle in handles.iter() {
    match handle
      .wait_until(Duration::from_secs(10), |s| s.last_snapshot.is_some())
      .await
    {
      Ok(status) => fragments.extend(status.last_snapshot),
      Err(e) => warn!(node = handle.id(), "no snapshot: {}", e),
    }
  }
  let cut = GlobalSnapshot::assemble(fragments);
  match cut.check_consistency() {
    Ok(()) => info!(in_flight = cut.in_flight().len(), "snapshot is consistent"),
    Err(e) => warn!("snapshot is inconsistent: {}", e),
  }
  for writer in writers {
    let _ = writer.await;
  }

  cluster.crash(nodes).await;
  let next = nodes - 1;
  match cluster.await_coordinator(next, Duration::from_secs(10)).await {
    Ok(()) => info!(coordinator = next, "re-elected after crash"),
    Err(e) => warn!("re-election did not converge: {}", e),
  }
  cluster.stop_all().await;
  info!(events = cluster.log.len(), "audit log");
}

async fn run_udp(path: PathBuf, id: NodeId, duration: Duration) {
  let file = match ClusterFile::load(&path) {
    Ok(f) => f,
    Err(e) => {
      error!("cannot read {}: {}", path.display(), e);
      exit(1);
    }
  };
  let (transport, inbox) = match UdpTransport::bind(id, &file.membership).await {
    Ok(x) => x,
    Err(e) => {
      error!(node = id, "cannot bind: {}", e);
      exit(1);
    }
  };
  let store = match FileCheckpointStore::new(format!("checkpoints-{}", id)) {
    Ok(s) => s,
    Err(e) => {
      error!(node = id, "cannot open checkpoint directory: {}", e);
      exit(1);
    }
  };
  let log = Arc::new(EventLog::new());
  let deps = NodeDeps {
    transport: Arc::new(transport),
    inbox: inbox,
    sink: log.clone(),
    checkpoints: Arc::new(store),
  };
  let node = SensorNode::spawn(id, &file.membership, file.node.clone(), deps);
  let stop_at = tokio::time::Instant::now() + duration;
  while tokio::time::Instant::now() < stop_at {
    if let Ok(r) = node.use_token_then_pass(Duration::from_secs(1)).await {
      info!(node = id, seq = r.seq, temperature = r.temperature, "reading sent");
    }
  }
  node.stop().await;
  info!(node = id, events = log.len(), coordinator = ?node.coordinator(), "done");
}
