//! weighted random replica selection, favoring servers with more free memory while
//! guaranteeing every live replica a traffic floor.

use std::{
    cell::{Cell, RefCell},
    collections::HashSet,
    rc::Rc,
};

use rand::Rng;

use super::route::{Route, Selector, ServerId, Stats};
use crate::error::{EmptyServerList, Error};

/// upper bound (exclusive) for the draw used in weighted selection.
pub const RAND_MAX: u64 = 1_000_000;

/// draws a value uniformly from `[0, n)`.
pub type RandFunc = Box<dyn FnMut(u64) -> u64>;

/// produces a fresh [`RandFunc`] per selector, so each request gets an independently
/// seeded generator.
pub type RandomFactory = Rc<dyn Fn() -> RandFunc>;

/// a [`RandomFactory`] backed by `rand`'s thread-local generator.
pub fn default_rand_factory() -> RandomFactory {
    Rc::new(|| {
        let mut rng = rand::thread_rng();
        Box::new(move |n: u64| rng.gen_range(0..n)) as RandFunc
    })
}

struct RouteConfig {
    servers: Vec<ServerId>,
    stats: Rc<dyn Stats>,
    rand_factory: RandomFactory,
    min_percent: f64,
}

/// a [`Route`] that spreads traffic across all configured replicas, weighted by each
/// replica's reported memory usage.
pub struct ReplicatedRoute {
    conf: Rc<RouteConfig>,
}

impl ReplicatedRoute {
    /// construct a route over `server_ids`, weighted using `stats`, with the default
    /// 1.0 percent traffic floor and the system random source.
    pub fn new(server_ids: Vec<ServerId>, stats: Rc<dyn Stats>) -> Result<Self, Error> {
        Self::with_config(server_ids, stats, default_rand_factory(), 1.0)
    }

    /// as [`ReplicatedRoute::new`], with an explicit traffic floor.
    pub fn with_min_percent(server_ids: Vec<ServerId>, stats: Rc<dyn Stats>, min_percent: f64) -> Result<Self, Error> {
        Self::with_config(server_ids, stats, default_rand_factory(), min_percent)
    }

    /// full constructor, for injecting a deterministic [`RandomFactory`] in tests.
    pub fn with_config(
        server_ids: Vec<ServerId>,
        stats: Rc<dyn Stats>,
        rand_factory: RandomFactory,
        min_percent: f64,
    ) -> Result<Self, Error> {
        if server_ids.is_empty() {
            return Err(EmptyServerList.into());
        }

        Ok(Self {
            conf: Rc::new(RouteConfig {
                servers: server_ids,
                stats,
                rand_factory,
                min_percent,
            }),
        })
    }
}

impl Route for ReplicatedRoute {
    fn new_selector(&self) -> Box<dyn Selector> {
        Box::new(ReplicatedSelector {
            conf: self.conf.clone(),
            chosen: Cell::new(None),
            failed: RefCell::new(HashSet::new()),
            rand_func: RefCell::new((self.conf.rand_factory)()),
        })
    }
}

/// per-request [`Selector`] produced by [`ReplicatedRoute`].
pub struct ReplicatedSelector {
    conf: Rc<RouteConfig>,
    chosen: Cell<Option<ServerId>>,
    failed: RefCell<HashSet<ServerId>>,
    rand_func: RefCell<RandFunc>,
}

impl ReplicatedSelector {
    fn compute_chosen(&self) -> bool {
        let mut remaining = Vec::new();
        let mut weights = Vec::new();

        {
            let mut failed = self.failed.borrow_mut();
            for &server_id in &self.conf.servers {
                if failed.contains(&server_id) {
                    continue;
                }
                match self.conf.stats.get_mem_usage(server_id) {
                    Some(usage) => {
                        remaining.push(server_id);
                        weights.push(usage);
                    }
                    None => {
                        failed.insert(server_id);
                    }
                }
            }
        }

        let mut ok = true;
        if remaining.is_empty() {
            remaining = self.conf.servers.clone();
            weights = vec![1.0; remaining.len()];
            ok = false;
        }

        if weights.iter().all(|&w| w < 1.0) {
            weights.iter_mut().for_each(|w| *w = 1.0);
        }

        recompute_weights_with_min_percent(&mut weights, self.conf.min_percent);

        for i in 1..weights.len() {
            weights[i] += weights[i - 1];
        }

        let max_weight = *weights.last().expect("remaining is never empty");
        let val = (self.rand_func.borrow_mut())(RAND_MAX);
        let chosen_weight = max_weight * (val as f64 / RAND_MAX as f64);

        let chosen = weights
            .iter()
            .position(|&w| w > chosen_weight)
            .map(|i| remaining[i])
            .unwrap_or_else(|| *remaining.last().expect("remaining is never empty"));

        self.chosen.set(Some(chosen));
        ok
    }
}

impl Selector for ReplicatedSelector {
    fn set_failed_server(&self, server_id: ServerId) {
        if !self.failed.borrow_mut().insert(server_id) {
            return;
        }
        self.conf.stats.notify_server_failed(server_id);
        self.reset();
    }

    fn select_server(&self, _key: &str) -> (ServerId, bool) {
        if let Some(chosen) = self.chosen.get() {
            return (chosen, true);
        }

        let ok = self.compute_chosen();
        (self.chosen.get().expect("compute_chosen always sets a choice"), ok)
    }

    fn select_servers_for_delete(&self, key: &str) -> Vec<ServerId> {
        self.select_server(key);

        let failed = self.failed.borrow();
        self.conf.servers.iter().copied().filter(|id| !failed.contains(id)).collect()
    }

    fn reset(&self) {
        self.chosen.set(None);
    }
}

/// lift every weight below `total * min_percent / 100` up to a shared floor so each
/// under-weighted replica still receives at least `min_percent` percent of traffic.
pub(crate) fn recompute_weights_with_min_percent(weights: &mut [f64], min_percent: f64) {
    let total: f64 = weights.iter().sum();
    let minimum = total * min_percent / 100.0;
    let k = weights.iter().filter(|&&w| w < minimum).count();
    let new_weight = total / (100.0 - k as f64 * min_percent);

    for w in weights.iter_mut() {
        if *w < minimum {
            *w = new_weight;
        }
    }
}
