//! background sampler for per-server memory usage, feeding [`ReplicatedRoute`](super::replicated::ReplicatedRoute)'s weighting.
//!
//! one long-lived worker thread owns every backing connection and polls each server on
//! a randomized interval, or immediately when [`ServerStats::notify_server_failed`]
//! wakes it early. the request thread only ever touches a shared mutex.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Condvar, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use rand::Rng;

use super::route::{ServerId, Stats};
use crate::{config::Config, error::Error};

/// called with `(server_id, used_memory_bytes)` every time a sample succeeds.
pub type MemLogger = Arc<dyn Fn(ServerId, f64) + Send + Sync>;

struct Control {
    notified: HashSet<ServerId>,
    closed: bool,
}

struct Shared {
    mem: Mutex<HashMap<ServerId, Option<f64>>>,
    control: Mutex<Control>,
    cond: Condvar,
}

/// samples `INFO memory`'s `used_memory` on every configured server.
pub struct ServerStats {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ServerStats {
    /// open a connection to every `(server_id, redis url)` pair and start the
    /// background sampler. every server is sampled once synchronously before this
    /// returns, so `get_mem_usage` has an initial value immediately.
    pub fn connect(servers: Vec<(ServerId, String)>, config: Config) -> Result<Self, Error> {
        Self::connect_with_logger(servers, config, Arc::new(|_id, _mem| {}))
    }

    /// as [`ServerStats::connect`], additionally invoking `mem_logger` on every
    /// successful sample.
    pub fn connect_with_logger(servers: Vec<(ServerId, String)>, config: Config, mem_logger: MemLogger) -> Result<Self, Error> {
        let mut ids = Vec::with_capacity(servers.len());
        let mut conns = HashMap::with_capacity(servers.len());
        let mut mem = HashMap::with_capacity(servers.len());

        for (id, url) in servers {
            let client = redis::Client::open(url)?;
            let conn = client.get_connection()?;
            ids.push(id);
            conns.insert(id, conn);
            mem.insert(id, None);
        }
        ids.sort_unstable();

        let shared = Arc::new(Shared {
            mem: Mutex::new(mem),
            control: Mutex::new(Control {
                notified: HashSet::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker_ids = ids.clone();
        let sleep_min = config.sleep_min();
        let sleep_max = config.sleep_max();
        let worker = thread::spawn(move || run(worker_ids, conns, sleep_min, sleep_max, mem_logger, worker_shared));

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// stop the background worker and wait for it to exit. idempotent; also run on
    /// [`Drop`].
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.worker.take() {
            self.shared.control.lock().unwrap().closed = true;
            self.shared.cond.notify_one();
            let _ = handle.join();
        }
    }
}

impl Stats for ServerStats {
    fn get_mem_usage(&self, server_id: ServerId) -> Option<f64> {
        self.shared.mem.lock().unwrap().get(&server_id).copied().flatten()
    }

    fn notify_server_failed(&self, server_id: ServerId) {
        let mut control = self.shared.control.lock().unwrap();
        control.notified.insert(server_id);
        self.shared.cond.notify_one();
    }
}

impl Drop for ServerStats {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rand_wake_up(sleep_min: u64, sleep_max: u64) -> Instant {
    let seconds = if sleep_min == sleep_max {
        sleep_min
    } else {
        rand::thread_rng().gen_range(sleep_min..=sleep_max)
    };
    Instant::now() + Duration::from_secs(seconds)
}

fn poll_one(conns: &mut HashMap<ServerId, redis::Connection>, id: ServerId, shared: &Shared, mem_logger: &MemLogger) {
    let sample = conns.get_mut(&id).map(query_used_memory);

    let mem = match sample {
        Some(Ok(used)) => {
            mem_logger(id, used);
            Some(used)
        }
        Some(Err(e)) => {
            tracing::error!(server_id = id, error = %e, "server stats poll failed");
            None
        }
        None => None,
    };

    shared.mem.lock().unwrap().insert(id, mem);
}

fn query_used_memory(conn: &mut redis::Connection) -> Result<f64, redis::RedisError> {
    let info: String = redis::cmd("INFO").arg("memory").query(conn)?;
    for line in info.lines() {
        if let Some(value) = line.strip_prefix("used_memory:") {
            if let Ok(n) = value.trim().parse::<f64>() {
                return Ok(n);
            }
        }
    }
    Ok(0.0)
}

fn run(
    servers: Vec<ServerId>,
    mut conns: HashMap<ServerId, redis::Connection>,
    sleep_min: u64,
    sleep_max: u64,
    mem_logger: MemLogger,
    shared: Arc<Shared>,
) {
    let mut next_wake_up: HashMap<ServerId, Instant> = HashMap::new();
    for &id in &servers {
        poll_one(&mut conns, id, &shared, &mem_logger);
        next_wake_up.insert(id, rand_wake_up(sleep_min, sleep_max));
    }

    loop {
        let notify_list;
        let timeout_servers;
        {
            let mut control = shared.control.lock().unwrap();
            loop {
                if control.closed {
                    return;
                }
                if !control.notified.is_empty() {
                    break;
                }

                let min_wake_up = servers.iter().map(|id| next_wake_up[id]).min().expect("servers is never empty");
                let now = Instant::now();
                if min_wake_up > now {
                    let (guard, _timed_out) = shared.cond.wait_timeout(control, min_wake_up - now).unwrap();
                    control = guard;
                }

                if control.closed {
                    return;
                }
                if !control.notified.is_empty() {
                    break;
                }

                let now = Instant::now();
                if servers.iter().any(|id| next_wake_up[id] <= now) {
                    break;
                }
            }

            let now = Instant::now();
            timeout_servers = servers.iter().copied().filter(|id| next_wake_up[id] <= now).collect::<Vec<_>>();
            notify_list = control.notified.drain().collect::<Vec<_>>();
        }

        for id in &timeout_servers {
            poll_one(&mut conns, *id, &shared, &mem_logger);
            next_wake_up.insert(*id, rand_wake_up(sleep_min, sleep_max));
        }
        for id in &notify_list {
            if timeout_servers.contains(id) {
                continue;
            }
            poll_one(&mut conns, *id, &shared, &mem_logger);
            next_wake_up.insert(*id, rand_wake_up(sleep_min, sleep_max));
        }
    }
}
