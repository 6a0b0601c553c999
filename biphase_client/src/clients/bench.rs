//! Random-workload benchmarking client: pulls the workload mix and a
//! backend from the load balancer, then loops issuing operations and
//! printing periodic latency/throughput summaries.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use biphase::{
    pf_info, pf_warn, BalReply, BalRequest, BalancerStub, BiphaseError,
    TwoPhaseAqClient,
};

use rand::distr::Alphanumeric;
use rand::Rng;

/// Interval between printed summary reports.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-operation-type latency statistics over one report interval.
#[derive(Debug, Default)]
struct OpStats {
    cnt: u64,
    total_us: u64,
    min_us: u64,
    max_us: u64,
}

impl OpStats {
    fn observe(&mut self, latency: Duration) {
        let us = latency.as_micros() as u64;
        if self.cnt == 0 || us < self.min_us {
            self.min_us = us;
        }
        if us > self.max_us {
            self.max_us = us;
        }
        self.cnt += 1;
        self.total_us += us;
    }

    fn mean_us(&self) -> u64 {
        if self.cnt == 0 {
            0
        } else {
            self.total_us / self.cnt
        }
    }

    fn reset(&mut self) {
        *self = OpStats::default();
    }
}

/// Benchmarking mode client struct.
pub struct ClientBench {
    /// Stub to the load-balancer front end.
    balancer: BalancerStub,

    /// Fraction of put operations.
    put_percent: f64,

    /// Fraction of remove operations.
    rem_percent: f64,

    /// Size of generated values in bytes.
    data_size: u64,

    /// Currently chosen backend.
    backend: SocketAddr,

    /// Protocol client endpoint onto the chosen backend.
    endpoint: TwoPhaseAqClient<String>,

    /// Keys touched so far.
    keys: Vec<String>,
}

impl ClientBench {
    /// Creates a new benchmarking client: asks the balancer for the
    /// workload parameters and an initial backend.
    pub async fn new_and_setup(
        balancer_addr: SocketAddr,
    ) -> Result<Self, BiphaseError> {
        let mut balancer = BalancerStub::new_by_connect(balancer_addr).await?;

        let put_percent =
            match balancer.call(BalRequest::GetPutPercent).await? {
                BalReply::PutPercent { percent } => percent,
                reply => {
                    return Err(BiphaseError(format!(
                        "unexpected balancer reply {:?}",
                        reply
                    )))
                }
            };
        let rem_percent =
            match balancer.call(BalRequest::GetRemPercent).await? {
                BalReply::RemPercent { percent } => percent,
                reply => {
                    return Err(BiphaseError(format!(
                        "unexpected balancer reply {:?}",
                        reply
                    )))
                }
            };
        let data_size = match balancer.call(BalRequest::GetSize).await? {
            BalReply::Size { size } => size,
            reply => {
                return Err(BiphaseError(format!(
                    "unexpected balancer reply {:?}",
                    reply
                )))
            }
        };

        let backend = match balancer
            .call(BalRequest::ChooseNode { current: None })
            .await?
        {
            BalReply::ChooseNode { node } => node,
            reply => {
                return Err(BiphaseError(format!(
                    "unexpected balancer reply {:?}",
                    reply
                )))
            }
        };
        let endpoint = TwoPhaseAqClient::new(backend);

        Ok(ClientBench {
            balancer,
            put_percent,
            rem_percent,
            data_size,
            backend,
            endpoint,
            keys: vec![],
        })
    }

    /// Generates a random alphanumeric string of given length.
    fn rand_string(len: usize) -> String {
        rand::rng()
            .sample_iter(Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    /// Picks a key for the next operation: mostly reuses a known key,
    /// occasionally minting a new one while the key space is still small.
    fn pick_key(&mut self, reuse_only: bool) -> String {
        let new_prob = if self.keys.len() <= 10 {
            1.0
        } else if self.keys.len() >= 100 || reuse_only {
            0.0
        } else {
            0.05
        };

        if self.keys.is_empty() || rand::rng().random::<f64>() < new_prob {
            let key = Self::rand_string(24);
            self.keys.push(key.clone());
            key
        } else {
            let idx = rand::rng().random_range(0..self.keys.len());
            self.keys[idx].clone()
        }
    }

    /// Switches to a freshly chosen backend after a connection failure.
    async fn switch_backend(&mut self) -> Result<(), BiphaseError> {
        let node = match self
            .balancer
            .call(BalRequest::ChooseNode {
                current: Some(self.backend),
            })
            .await?
        {
            BalReply::ChooseNode { node } => node,
            reply => {
                return Err(BiphaseError(format!(
                    "unexpected balancer reply {:?}",
                    reply
                )))
            }
        };

        pf_warn!("c"; "switching backend '{}' -> '{}'", self.backend, node);
        self.backend = node;
        self.endpoint = TwoPhaseAqClient::new(node);
        self.endpoint.connect().await
    }

    /// Runs the benchmarking loop forever.
    pub async fn run(&mut self) -> Result<(), BiphaseError> {
        self.endpoint.connect().await?;
        pf_info!("c"; "benchmarking against '{}': put {:.2} rem {:.2} size {}",
                      self.backend, self.put_percent, self.rem_percent,
                      self.data_size);

        let mut put_stats = OpStats::default();
        let mut rem_stats = OpStats::default();
        let mut get_stats = OpStats::default();
        let mut last_report = Instant::now();

        loop {
            let prob: f64 = rand::rng().random();
            let op_start = Instant::now();

            let result = if prob < self.put_percent {
                let key = self.pick_key(false);
                let value = Self::rand_string(self.data_size as usize);
                self.endpoint
                    .put(&key, value)
                    .await
                    .map(|()| &mut put_stats)
            } else if prob - self.put_percent < self.rem_percent {
                if self.keys.is_empty() {
                    continue;
                }
                let key = self.pick_key(true);
                self.endpoint.remove(&key).await.map(|()| &mut rem_stats)
            } else {
                let key = self.pick_key(false);
                self.endpoint.get(&key).await.map(|_| &mut get_stats)
            };

            match result {
                Ok(stats) => stats.observe(op_start.elapsed()),
                Err(e) => {
                    pf_warn!("c"; "operation failed: {}", e);
                    self.switch_backend().await?;
                    continue;
                }
            }

            let elapsed = last_report.elapsed();
            if elapsed >= REPORT_INTERVAL {
                let secs = elapsed.as_secs_f64();
                println!("TIME ELAPSED : {:.1} ms", secs * 1000.0);
                for (name, stats) in [
                    ("PUT", &mut put_stats),
                    ("REM", &mut rem_stats),
                    ("GET", &mut get_stats),
                ] {
                    println!(
                        "{} : {} {} {} us, {:.1} ops/s",
                        name,
                        stats.min_us,
                        stats.mean_us(),
                        stats.max_us,
                        stats.cnt as f64 / secs,
                    );
                    stats.reset();
                }
                last_report = Instant::now();
            }
        }
    }
}
