//! replicated [`Pipeline`]/[`CacheClient`] that fans a single logical request out over
//! per-server child pipelines chosen by a [`Route`].

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use super::route::{Route, Selector, ServerId};
use crate::{
    pipeline::{CacheClient, DeleteOutcome, Deferred, LeaseGetOutcome, LeaseSetOutcome, Pipeline},
    session::Session,
};

struct Shared {
    clients: Rc<HashMap<ServerId, Rc<dyn CacheClient>>>,
    pipe_sess: Session,
    sess: Session,
    selector: Box<dyn Selector>,
    pipelines: RefCell<HashMap<ServerId, Rc<dyn Pipeline>>>,
    lease_origin: RefCell<HashMap<String, Option<ServerId>>>,
}

impl Shared {
    fn pipeline_for(&self, server_id: ServerId) -> Rc<dyn Pipeline> {
        if let Some(pipe) = self.pipelines.borrow().get(&server_id) {
            return pipe.clone();
        }

        let client = self
            .clients
            .get(&server_id)
            .expect("route selected a server id with no configured client");
        let pipe: Rc<dyn Pipeline> = Rc::from(client.pipeline(Some(self.pipe_sess.clone())));
        self.pipelines.borrow_mut().insert(server_id, pipe.clone());
        pipe
    }

    fn drain(&self) {
        self.sess.execute();
        self.selector.reset();
    }
}

/// a [`Pipeline`] that routes each call through a [`Route`]'s per-request [`Selector`],
/// retrying a failed `lease_get` on the next live replica.
pub struct ProxyPipeline {
    shared: Rc<Shared>,
}

impl Pipeline for ProxyPipeline {
    fn lease_get(&self, key: &str) -> Deferred<LeaseGetOutcome> {
        let (server_id, _ok) = self.shared.selector.select_server(key);
        let outcome = Rc::new(RefCell::new(None));
        issue_lease_get(self.shared.clone(), key.to_owned(), outcome.clone(), server_id);

        let shared = self.shared.clone();
        Box::new(move || {
            shared.drain();
            outcome.borrow_mut().take().expect("proxy lease_get continuation always produces an outcome")
        })
    }

    fn lease_set(&self, key: &str, cas: u64, data: Vec<u8>) -> Deferred<LeaseSetOutcome> {
        let origin = self.shared.lease_origin.borrow().get(key).copied().flatten();
        let Some(server_id) = origin else {
            return Box::new(|| LeaseSetOutcome::Error("proxy: can not do lease set".to_owned()));
        };

        self.shared.pipeline_for(server_id).lease_set(key, cas, data)
    }

    fn delete(&self, key: &str) -> Deferred<DeleteOutcome> {
        let servers = self.shared.selector.select_servers_for_delete(key);
        let deferreds: Vec<(ServerId, Deferred<DeleteOutcome>)> = servers
            .into_iter()
            .map(|id| (id, self.shared.pipeline_for(id).delete(key)))
            .collect();

        let outcome: Rc<RefCell<Option<DeleteOutcome>>> = Rc::new(RefCell::new(None));
        let outcome_for_call = outcome.clone();
        let shared = self.shared.clone();
        self.shared.sess.add_next_call(move || {
            let mut any_ok = false;
            let mut all_not_found = true;

            for (server_id, deferred) in deferreds {
                match deferred() {
                    DeleteOutcome::Ok => {
                        any_ok = true;
                        all_not_found = false;
                    }
                    DeleteOutcome::NotFound => {}
                    DeleteOutcome::Error(_) => {
                        all_not_found = false;
                        shared.selector.set_failed_server(server_id);
                    }
                }
            }

            let result = if any_ok {
                DeleteOutcome::Ok
            } else if all_not_found {
                DeleteOutcome::NotFound
            } else {
                DeleteOutcome::Error("proxy: delete failed on every replica".to_owned())
            };
            *outcome_for_call.borrow_mut() = Some(result);
        });

        let shared = self.shared.clone();
        Box::new(move || {
            shared.drain();
            outcome.borrow_mut().take().expect("proxy delete continuation always produces an outcome")
        })
    }

    fn lower_session(&self) -> Session {
        self.shared.sess.get_lower()
    }

    fn finish(&self) {
        for pipe in self.shared.pipelines.borrow().values() {
            pipe.finish();
        }
    }
}

fn record_lease_origin(shared: &Shared, key: &str, server_id: ServerId) {
    let mut origin = shared.lease_origin.borrow_mut();
    match origin.get(key) {
        Some(Some(prev)) if *prev != server_id => {
            origin.insert(key.to_owned(), None);
        }
        _ => {
            origin.insert(key.to_owned(), Some(server_id));
        }
    }
}

fn issue_lease_get(shared: Rc<Shared>, key: String, outcome: Rc<RefCell<Option<LeaseGetOutcome>>>, server_id: ServerId) {
    let get_fn = shared.pipeline_for(server_id).lease_get(&key);

    shared.sess.add_next_call(move || {
        let result = get_fn();

        match result {
            LeaseGetOutcome::Error(_) => {
                shared.selector.set_failed_server(server_id);
                let (next_id, ok) = shared.selector.select_server(&key);
                if !ok {
                    *outcome.borrow_mut() = Some(result);
                    return;
                }
                issue_lease_get(shared, key, outcome, next_id);
            }
            LeaseGetOutcome::LeaseGranted(_) => {
                record_lease_origin(&shared, &key, server_id);
                *outcome.borrow_mut() = Some(result);
            }
            LeaseGetOutcome::Found(_) => {
                *outcome.borrow_mut() = Some(result);
            }
        }
    });
}

/// a [`CacheClient`] backed by one child client per server, fanned out via a [`Route`].
pub struct ProxyCacheClient {
    clients: Rc<HashMap<ServerId, Rc<dyn CacheClient>>>,
    route: Rc<dyn Route>,
}

impl ProxyCacheClient {
    /// `new_client(server_id)` is called once per id in `server_ids` to build the
    /// underlying per-server clients.
    pub fn new<F>(server_ids: Vec<ServerId>, mut new_client: F, route: Rc<dyn Route>) -> Self
    where
        F: FnMut(ServerId) -> Box<dyn CacheClient>,
    {
        let clients = server_ids.into_iter().map(|id| (id, Rc::from(new_client(id)))).collect();
        Self {
            clients: Rc::new(clients),
            route,
        }
    }
}

impl CacheClient for ProxyCacheClient {
    fn pipeline(&self, sess: Option<Session>) -> Box<dyn Pipeline> {
        let pipe_sess = sess.unwrap_or_default();
        let sess = pipe_sess.get_lower();

        Box::new(ProxyPipeline {
            shared: Rc::new(Shared {
                clients: self.clients.clone(),
                pipe_sess,
                sess,
                selector: self.route.new_selector(),
                pipelines: RefCell::new(HashMap::new()),
                lease_origin: RefCell::new(HashMap::new()),
            }),
        })
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, collections::HashMap, rc::Rc};

    use super::*;
    use crate::proxy::route::Stats;

    struct StatsFake {
        mem: HashMap<ServerId, f64>,
        failed: RefCell<std::collections::HashSet<ServerId>>,
    }

    impl Stats for StatsFake {
        fn get_mem_usage(&self, server_id: ServerId) -> Option<f64> {
            if self.failed.borrow().contains(&server_id) {
                return None;
            }
            self.mem.get(&server_id).copied()
        }

        fn notify_server_failed(&self, server_id: ServerId) {
            self.failed.borrow_mut().insert(server_id);
        }
    }

    struct FakePipeline {
        actions: Rc<RefCell<Vec<String>>>,
        get_results: RefCell<Vec<LeaseGetOutcome>>,
        set_calls: Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>,
    }

    impl Pipeline for FakePipeline {
        fn lease_get(&self, key: &str) -> Deferred<LeaseGetOutcome> {
            let key = key.to_owned();
            self.actions.borrow_mut().push(key.clone());
            let actions = self.actions.clone();
            let outcome = self.get_results.borrow_mut().remove(0);
            Box::new(move || {
                actions.borrow_mut().push(format!("{key}:func"));
                outcome
            })
        }

        fn lease_set(&self, key: &str, cas: u64, data: Vec<u8>) -> Deferred<LeaseSetOutcome> {
            self.set_calls.borrow_mut().push((key.to_owned(), cas, data));
            self.actions.borrow_mut().push(format!("set {key}"));
            let actions = self.actions.clone();
            let key = key.to_owned();
            Box::new(move || {
                actions.borrow_mut().push(format!("set {key}:func"));
                LeaseSetOutcome::Ok
            })
        }

        fn delete(&self, _key: &str) -> Deferred<DeleteOutcome> {
            Box::new(|| DeleteOutcome::Ok)
        }

        fn lower_session(&self) -> Session {
            Session::new()
        }

        fn finish(&self) {}
    }

    struct FakeClient {
        actions: Rc<RefCell<Vec<String>>>,
        set_calls: Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>,
        get_results: RefCell<Vec<LeaseGetOutcome>>,
    }

    impl CacheClient for FakeClient {
        fn pipeline(&self, _sess: Option<Session>) -> Box<dyn Pipeline> {
            Box::new(FakePipeline {
                actions: self.actions.clone(),
                get_results: RefCell::new(self.get_results.borrow_mut().drain(..).collect()),
                set_calls: self.set_calls.clone(),
            })
        }
    }

    fn fixed_route(failed: &[ServerId]) -> Rc<dyn Route> {
        use super::super::replicated::{RandFunc, RandomFactory, ReplicatedRoute};
        let stats = Rc::new(StatsFake {
            mem: HashMap::from([(21, 100.0), (22, 100.0), (23, 100.0)]),
            failed: RefCell::new(failed.iter().copied().collect()),
        });
        let factory: RandomFactory = Rc::new(|| Box::new(|_n: u64| 0) as RandFunc);
        Rc::new(ReplicatedRoute::with_config(vec![21, 22, 23], stats, factory, 1.0).unwrap())
    }

    struct Harness {
        client: ProxyCacheClient,
        actions: HashMap<ServerId, Rc<RefCell<Vec<String>>>>,
        set_calls: HashMap<ServerId, Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>>,
    }

    /// builds a [`ProxyCacheClient`] over servers 21/22/23, pre-loading each server's fake
    /// client with the `lease_get` outcomes from `fixtures` (consumed in call order).
    fn build_harness(failed: &[ServerId], mut fixtures: HashMap<ServerId, Vec<LeaseGetOutcome>>) -> Harness {
        let route = fixed_route(failed);

        let actions: Rc<RefCell<HashMap<ServerId, Rc<RefCell<Vec<String>>>>>> = Rc::new(RefCell::new(HashMap::new()));
        let set_calls: Rc<RefCell<HashMap<ServerId, Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>>>> =
            Rc::new(RefCell::new(HashMap::new()));

        let actions_for_new = actions.clone();
        let set_calls_for_new = set_calls.clone();

        let client = ProxyCacheClient::new(
            vec![21, 22, 23],
            move |server_id| {
                let server_actions = Rc::new(RefCell::new(Vec::new()));
                actions_for_new.borrow_mut().insert(server_id, server_actions.clone());
                let server_set_calls = Rc::new(RefCell::new(Vec::new()));
                set_calls_for_new.borrow_mut().insert(server_id, server_set_calls.clone());
                let server_fixtures = fixtures.remove(&server_id).unwrap_or_default();

                Box::new(FakeClient {
                    actions: server_actions,
                    set_calls: server_set_calls,
                    get_results: RefCell::new(server_fixtures),
                }) as Box<dyn CacheClient>
            },
            route,
        );

        Harness {
            client,
            actions: Rc::try_unwrap(actions).unwrap().into_inner(),
            set_calls: Rc::try_unwrap(set_calls).unwrap().into_inner(),
        }
    }

    #[test]
    fn lease_get_found_routes_to_the_selected_replica() {
        let harness = build_harness(&[], HashMap::from([(21, vec![LeaseGetOutcome::Found(b"data 01".to_vec())])]));

        let pipe = harness.client.pipeline(None);
        let get = pipe.lease_get("key01");
        assert_eq!(get(), LeaseGetOutcome::Found(b"data 01".to_vec()));
        assert_eq!(*harness.actions[&21].borrow(), vec!["key01", "key01:func"]);
        assert!(harness.actions[&22].borrow().is_empty());
    }

    #[test]
    fn lease_set_without_a_prior_get_is_rejected() {
        let harness = build_harness(&[], HashMap::new());
        let pipe = harness.client.pipeline(None);
        let set = pipe.lease_set("key01", 71, b"data 01".to_vec());
        assert_eq!(set(), LeaseSetOutcome::Error("proxy: can not do lease set".to_owned()));
        assert!(harness.set_calls[&21].borrow().is_empty());
    }

    #[test]
    fn lease_get_then_set_targets_the_granting_replica() {
        let harness = build_harness(&[], HashMap::from([(21, vec![LeaseGetOutcome::LeaseGranted(61)])]));

        let pipe = harness.client.pipeline(None);
        let get = pipe.lease_get("key01");
        assert_eq!(get(), LeaseGetOutcome::LeaseGranted(61));

        let set = pipe.lease_set("key01", 61, b"data 01".to_vec());
        assert_eq!(set(), LeaseSetOutcome::Ok);
        assert_eq!(harness.set_calls[&21].borrow().as_slice(), &[("key01".to_owned(), 61, b"data 01".to_vec())]);
    }

    #[test]
    fn lease_get_error_retries_on_the_next_replica() {
        let harness = build_harness(
            &[],
            HashMap::from([
                (21, vec![LeaseGetOutcome::Error("server error".to_owned())]),
                (22, vec![LeaseGetOutcome::Found(b"data 01".to_vec())]),
            ]),
        );

        let pipe = harness.client.pipeline(None);
        let get = pipe.lease_get("key01");
        assert_eq!(get(), LeaseGetOutcome::Found(b"data 01".to_vec()));
        assert_eq!(*harness.actions[&21].borrow(), vec!["key01", "key01:func"]);
        assert_eq!(*harness.actions[&22].borrow(), vec!["key01", "key01:func"]);
    }

    #[test]
    fn lease_get_with_every_replica_already_failed_does_not_retry() {
        let harness = build_harness(
            &[21, 22],
            HashMap::from([(23, vec![LeaseGetOutcome::Error("server error".to_owned())])]),
        );

        let pipe = harness.client.pipeline(None);
        let get = pipe.lease_get("key01");
        assert_eq!(get(), LeaseGetOutcome::Error("server error".to_owned()));
        assert_eq!(*harness.actions[&23].borrow(), vec!["key01", "key01:func"]);
    }

    #[test]
    fn lease_get_then_set_after_retrying_still_targets_the_granting_replica() {
        let harness = build_harness(
            &[],
            HashMap::from([
                (21, vec![LeaseGetOutcome::Error("server error".to_owned())]),
                (22, vec![LeaseGetOutcome::LeaseGranted(61)]),
            ]),
        );

        let pipe = harness.client.pipeline(None);
        let get = pipe.lease_get("key01");
        assert_eq!(get(), LeaseGetOutcome::LeaseGranted(61));

        let set = pipe.lease_set("key01", 61, b"data 01".to_vec());
        assert_eq!(set(), LeaseSetOutcome::Ok);
        assert_eq!(harness.set_calls[&22].borrow().as_slice(), &[("key01".to_owned(), 61, b"data 01".to_vec())]);
    }

    #[test]
    fn a_later_lease_get_for_the_same_key_on_a_different_replica_voids_the_earlier_origin() {
        let harness = build_harness(
            &[],
            HashMap::from([
                (21, vec![LeaseGetOutcome::LeaseGranted(61), LeaseGetOutcome::Error("server error".to_owned())]),
                (22, vec![LeaseGetOutcome::LeaseGranted(62), LeaseGetOutcome::LeaseGranted(62)]),
            ]),
        );

        let pipe = harness.client.pipeline(None);
        let first = pipe.lease_get("key01");
        assert_eq!(first(), LeaseGetOutcome::LeaseGranted(61));

        // a second, unrelated get against 21 fails and pushes the selector onto 22.
        let unrelated = pipe.lease_get("key02");
        assert_eq!(unrelated(), LeaseGetOutcome::LeaseGranted(62));

        let second = pipe.lease_get("key01");
        assert_eq!(second(), LeaseGetOutcome::LeaseGranted(62));

        let set = pipe.lease_set("key01", 62, b"data 01".to_vec());
        assert_eq!(set(), LeaseSetOutcome::Error("proxy: can not do lease set".to_owned()));
    }

    #[test]
    fn lease_get_multi_sends_one_request_per_key_per_server() {
        let harness = build_harness(
            &[],
            HashMap::from([(
                21,
                vec![
                    LeaseGetOutcome::Found(b"data 01".to_vec()),
                    LeaseGetOutcome::Found(b"data 02".to_vec()),
                    LeaseGetOutcome::Found(b"data 03".to_vec()),
                ],
            )]),
        );

        let pipe = harness.client.pipeline(None);
        let g1 = pipe.lease_get("key01");
        let g2 = pipe.lease_get("key02");
        let g3 = pipe.lease_get("key03");

        assert_eq!(g1(), LeaseGetOutcome::Found(b"data 01".to_vec()));
        assert_eq!(g2(), LeaseGetOutcome::Found(b"data 02".to_vec()));
        assert_eq!(g3(), LeaseGetOutcome::Found(b"data 03".to_vec()));
        assert_eq!(
            *harness.actions[&21].borrow(),
            vec!["key01", "key02", "key03", "key01:func", "key02:func", "key03:func"]
        );
    }
}
