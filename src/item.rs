//! cache-aside fill layer: request a value, falling through to a caller-supplied filler
//! and writing the result back under the lease when the cache missed.
//!
//! get/fill/set-back are scheduled on the owning pipeline's [`lower_session`][lower], so
//! many `get`s batched into one request round-trip once for the gets, then fill misses
//! in parallel, then round-trip once more for the set-backs.
//!
//! [lower]: crate::pipeline::Pipeline::lower_session

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    hash::Hash,
    rc::Rc,
};

use super::{
    pipeline::{Deferred, LeaseGetOutcome, Pipeline},
    session::Session,
};

/// encodes a value to the bytes stored in the cache, and decodes them back.
///
/// decode failures are recoverable (the item falls through to the filler); encode is
/// assumed infallible for well-formed codecs.
pub struct ItemCodec<T> {
    encode: Box<dyn Fn(&T) -> Vec<u8>>,
    decode: Box<dyn Fn(&[u8]) -> Result<T, String>>,
}

impl<T> ItemCodec<T> {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&T) -> Vec<u8> + 'static,
        D: Fn(&[u8]) -> Result<T, String> + 'static,
    {
        Self {
            encode: Box::new(encode),
            decode: Box::new(decode),
        }
    }
}

/// a codec that stores values as JSON.
#[cfg(feature = "json")]
pub fn new_json_codec<T>() -> ItemCodec<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    ItemCodec::new(
        |value: &T| serde_json::to_vec(value).expect("value failed to serialize to JSON"),
        |bytes: &[u8]| serde_json::from_slice(bytes).map_err(|e| e.to_string()),
    )
}

/// hit/fill/cache-error/decode-error/bytes-read counters for one [`Item`].
#[derive(Default)]
pub struct Counters {
    hits: Cell<u64>,
    fills: Cell<u64>,
    cache_errors: Cell<u64>,
    decode_errors: Cell<u64>,
    bytes_read: Cell<u64>,
}

impl Counters {
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn fills(&self) -> u64 {
        self.fills.get()
    }

    pub fn cache_errors(&self) -> u64 {
        self.cache_errors.get()
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.get()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.get()
    }

    fn incr_hits(&self) {
        self.hits.set(self.hits.get() + 1);
    }

    fn incr_fills(&self) {
        self.fills.set(self.fills.get() + 1);
    }

    fn incr_cache_errors(&self) {
        self.cache_errors.set(self.cache_errors.get() + 1);
    }

    fn incr_decode_errors(&self) {
        self.decode_errors.set(self.decode_errors.get() + 1);
    }

    fn add_bytes_read(&self, n: u64) {
        self.bytes_read.set(self.bytes_read.get() + n);
    }
}

/// gets keys of type `K` holding values of type `T`, filling on miss with a
/// caller-supplied function and writing the value back under the granted lease.
pub struct Item<K, T> {
    pipe: Rc<dyn Pipeline>,
    sess: Session,
    key_fn: Rc<dyn Fn(&K) -> String>,
    filler: Rc<dyn Fn(&K) -> Deferred<T>>,
    codec: Rc<ItemCodec<T>>,
    counters: Rc<Counters>,
}

impl<K, T> Item<K, T>
where
    K: 'static,
    T: 'static,
{
    pub fn new<F, Fill>(pipe: Box<dyn Pipeline>, key_fn: F, filler: Fill, codec: ItemCodec<T>) -> Self
    where
        F: Fn(&K) -> String + 'static,
        Fill: Fn(&K) -> Deferred<T> + 'static,
    {
        let pipe: Rc<dyn Pipeline> = Rc::from(pipe);
        let sess = pipe.lower_session();
        Self {
            pipe,
            sess,
            key_fn: Rc::new(key_fn),
            filler: Rc::new(filler),
            codec: Rc::new(codec),
            counters: Rc::new(Counters::default()),
        }
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn compute_key_name(&self, key: &K) -> String {
        (self.key_fn)(key)
    }

    /// fetch `key`, falling through to the filler on a cache miss or decode failure.
    pub fn get(&self, key: K) -> Deferred<T> {
        let key_str = (self.key_fn)(&key);
        let lease_get = self.pipe.lease_get(&key_str);

        let result: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));

        let pipe = self.pipe.clone();
        let codec = self.codec.clone();
        let filler = self.filler.clone();
        let counters = self.counters.clone();
        let sess_for_fill = self.sess.clone();
        let result_for_next = result.clone();

        self.sess.add_next_call(move || {
            let mut cas: u64 = 0;
            let mut filled = false;

            match lease_get() {
                LeaseGetOutcome::Found(data) => match (codec.decode)(&data) {
                    Ok(value) => {
                        counters.incr_hits();
                        counters.add_bytes_read(data.len() as u64);
                        *result_for_next.borrow_mut() = Some(value);
                        filled = true;
                    }
                    Err(e) => {
                        counters.incr_decode_errors();
                        tracing::error!(key = %key_str, error = %e, "item decode error");
                    }
                },
                LeaseGetOutcome::LeaseGranted(granted_cas) => {
                    cas = granted_cas;
                }
                LeaseGetOutcome::Error(e) => {
                    counters.incr_cache_errors();
                    tracing::error!(key = %key_str, error = %e, "item get error");
                }
            }

            if filled {
                return;
            }

            counters.incr_fills();
            let fill_fn = (filler)(&key);

            let codec = codec.clone();
            let pipe = pipe.clone();
            let sess_for_set = sess_for_fill.clone();
            let result_for_fill = result_for_next.clone();
            let key_str = key_str.clone();

            sess_for_fill.add_next_call(move || {
                let value = fill_fn();

                if cas > 0 {
                    let data = (codec.encode)(&value);
                    let set_fn = pipe.lease_set(&key_str, cas, data);
                    sess_for_set.add_next_call(move || {
                        let _ = set_fn();
                    });
                }

                *result_for_fill.borrow_mut() = Some(value);
            });
        });

        let sess = self.sess.clone();
        Box::new(move || {
            sess.execute();
            result
                .borrow_mut()
                .take()
                .expect("item continuation chain always produces a result before sess.execute() returns")
        })
    }

    /// `get` applied to every key, as one aggregate deferred.
    pub fn get_multi(&self, keys: Vec<K>) -> Deferred<Vec<T>> {
        let fns: Vec<Deferred<T>> = keys.into_iter().map(|k| self.get(k)).collect();
        Box::new(move || fns.into_iter().map(|f| f()).collect())
    }
}

struct Round<K, V> {
    keys: Vec<K>,
    result: HashMap<K, V>,
    completed: bool,
}

/// coalesces many independent per-key fillers into one batch call.
///
/// every key requested before the first deferred is realized shares one call to the
/// wrapped batch function; keys requested after that first realization start a new
/// round.
pub struct MultiGetFiller<K, V> {
    fill: Rc<dyn Fn(&[K]) -> Vec<V>>,
    key_of: Rc<dyn Fn(&V) -> K>,
    default: V,
    current: Rc<RefCell<Option<Rc<RefCell<Round<K, V>>>>>>,
}

impl<K, V> MultiGetFiller<K, V>
where
    K: Eq + Hash + Clone + 'static,
    V: Clone + 'static,
{
    pub fn new<F, G>(fill: F, key_of: G, default: V) -> Self
    where
        F: Fn(&[K]) -> Vec<V> + 'static,
        G: Fn(&V) -> K + 'static,
    {
        Self {
            fill: Rc::new(fill),
            key_of: Rc::new(key_of),
            default,
            current: Rc::new(RefCell::new(None)),
        }
    }

    /// a filler function suitable for [`Item::new`].
    pub fn filler(&self) -> impl Fn(&K) -> Deferred<V> + 'static {
        let fill = self.fill.clone();
        let key_of = self.key_of.clone();
        let default = self.default.clone();
        let current = self.current.clone();

        move |key: &K| {
            let round = {
                let mut slot = current.borrow_mut();
                if slot.is_none() {
                    *slot = Some(Rc::new(RefCell::new(Round {
                        keys: Vec::new(),
                        result: HashMap::new(),
                        completed: false,
                    })));
                }
                slot.as_ref().unwrap().clone()
            };
            round.borrow_mut().keys.push(key.clone());

            let fill = fill.clone();
            let key_of = key_of.clone();
            let default = default.clone();
            let current = current.clone();
            let round = round.clone();
            let key = key.clone();

            Box::new(move || {
                if !round.borrow().completed {
                    let keys = round.borrow().keys.clone();
                    let values = (fill)(&keys);

                    let mut r = round.borrow_mut();
                    for v in values {
                        r.result.insert((key_of)(&v), v);
                    }
                    r.completed = true;
                    drop(r);

                    let mut slot = current.borrow_mut();
                    if slot.as_ref().is_some_and(|cur| Rc::ptr_eq(cur, &round)) {
                        *slot = None;
                    }
                }

                round.borrow().result.get(&key).cloned().unwrap_or_else(|| default.clone())
            })
        }
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::pipeline::{CacheClient, DeleteOutcome, LeaseSetOutcome};

    struct FakePipeline {
        sess: Session,
        lower: Session,
        get_outcomes: RefCell<HashMap<String, LeaseGetOutcome>>,
        set_calls: Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>,
    }

    impl Pipeline for FakePipeline {
        fn lease_get(&self, key: &str) -> Deferred<LeaseGetOutcome> {
            let outcome = self
                .get_outcomes
                .borrow_mut()
                .remove(key)
                .unwrap_or(LeaseGetOutcome::Error("no fixture".to_owned()));
            Box::new(move || outcome)
        }

        fn lease_set(&self, key: &str, cas: u64, data: Vec<u8>) -> Deferred<LeaseSetOutcome> {
            self.set_calls.borrow_mut().push((key.to_owned(), cas, data));
            Box::new(|| LeaseSetOutcome::Ok)
        }

        fn delete(&self, _key: &str) -> Deferred<DeleteOutcome> {
            Box::new(|| DeleteOutcome::Ok)
        }

        fn lower_session(&self) -> Session {
            self.lower.clone()
        }

        fn finish(&self) {}
    }

    struct FakeClient {
        set_calls: Rc<RefCell<Vec<(String, u64, Vec<u8>)>>>,
        get_outcomes: RefCell<Option<HashMap<String, LeaseGetOutcome>>>,
    }

    impl CacheClient for FakeClient {
        fn pipeline(&self, sess: Option<Session>) -> Box<dyn Pipeline> {
            let sess = sess.unwrap_or_default();
            let lower = sess.get_lower();
            Box::new(FakePipeline {
                sess,
                lower,
                get_outcomes: RefCell::new(self.get_outcomes.borrow_mut().take().unwrap_or_default()),
                set_calls: self.set_calls.clone(),
            })
        }
    }

    fn raw_codec() -> ItemCodec<String> {
        ItemCodec::new(
            |v: &String| v.as_bytes().to_vec(),
            |b: &[u8]| Ok(String::from_utf8_lossy(b).into_owned()),
        )
    }

    #[test]
    fn found_value_decodes_without_filling() {
        let mut fixtures = HashMap::new();
        fixtures.insert("k:1".to_owned(), LeaseGetOutcome::Found(b"hello".to_vec()));
        let client = FakeClient {
            set_calls: Rc::new(RefCell::new(Vec::new())),
            get_outcomes: RefCell::new(Some(fixtures)),
        };

        let fill_calls = Rc::new(RefCell::new(0));
        let fc = fill_calls.clone();
        let item = Item::new(
            client.pipeline(None),
            |k: &u32| format!("k:{k}"),
            move |_k: &u32| {
                *fc.borrow_mut() += 1;
                Box::new(|| "filled".to_owned())
            },
            raw_codec(),
        );

        let get = item.get(1);
        assert_eq!(get(), "hello");
        assert_eq!(*fill_calls.borrow(), 0);
        assert_eq!(item.counters().hits(), 1);
        assert_eq!(item.counters().fills(), 0);
    }

    #[test]
    fn lease_granted_fills_and_sets_back() {
        let mut fixtures = HashMap::new();
        fixtures.insert("k:2".to_owned(), LeaseGetOutcome::LeaseGranted(7));
        let set_calls = Rc::new(RefCell::new(Vec::new()));
        let client = FakeClient {
            set_calls: set_calls.clone(),
            get_outcomes: RefCell::new(Some(fixtures)),
        };

        let item = Item::new(
            client.pipeline(None),
            |k: &u32| format!("k:{k}"),
            |_k: &u32| Box::new(|| "filled".to_owned()),
            raw_codec(),
        );

        let get = item.get(2);
        assert_eq!(get(), "filled");
        assert_eq!(item.counters().fills(), 1);
        assert_eq!(set_calls.borrow().as_slice(), &[("k:2".to_owned(), 7, b"filled".to_vec())]);
    }

    #[test]
    fn cache_error_fills_without_set_back() {
        let mut fixtures = HashMap::new();
        fixtures.insert("k:3".to_owned(), LeaseGetOutcome::Error("down".to_owned()));
        let set_calls = Rc::new(RefCell::new(Vec::new()));
        let client = FakeClient {
            set_calls: set_calls.clone(),
            get_outcomes: RefCell::new(Some(fixtures)),
        };

        let item = Item::new(
            client.pipeline(None),
            |k: &u32| format!("k:{k}"),
            |_k: &u32| Box::new(|| "filled".to_owned()),
            raw_codec(),
        );

        let get = item.get(3);
        assert_eq!(get(), "filled");
        assert_eq!(item.counters().cache_errors(), 1);
        assert!(set_calls.borrow().is_empty());
    }

    #[test]
    fn multi_get_filler_batches_keys_accumulated_before_first_realization() {
        let fill_calls: Rc<RefCell<Vec<Vec<u32>>>> = Rc::new(RefCell::new(Vec::new()));
        let fc = fill_calls.clone();
        let filler = MultiGetFiller::new(
            move |keys: &[u32]| {
                fc.borrow_mut().push(keys.to_vec());
                keys.iter().map(|k| k * 10).collect::<Vec<u32>>()
            },
            |v: &u32| v / 10,
            0,
        );
        let f = filler.filler();

        let a = f(&1);
        let b = f(&2);

        assert_eq!(a(), 10);
        assert_eq!(b(), 20);
        assert_eq!(*fill_calls.borrow(), vec![vec![1, 2]]);

        let c = f(&3);
        assert_eq!(c(), 30);
        assert_eq!(fill_calls.borrow().len(), 2);
    }

    #[test]
    fn multi_get_filler_returns_default_for_missing_key() {
        let filler = MultiGetFiller::new(|_keys: &[u32]| Vec::<u32>::new(), |v: &u32| *v, 999);
        let f = filler.filler();
        let a = f(&5);
        assert_eq!(a(), 999);
    }
}
