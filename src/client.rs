//! single-server [`Pipeline`] and [`CacheClient`] backed by the `redis` crate.
//!
//! a [`RedisPipeline`] accumulates `lease_get`/`lease_set`/`delete` calls into a pending
//! batch and flushes it in one round trip per op kind, in the fixed order gets, sets,
//! deletes. the flush itself runs as a continuation on the pipeline's session, scheduled
//! the moment the batch's first call is made; realizing any deferred drains that session,
//! which is what actually triggers the round trip.

use std::{cell::RefCell, rc::Rc};

use rand::Rng;
use redis::Script;

use super::{
    config::Config,
    error::Error,
    pipeline::{decode_get_body, CacheClient, DeleteOutcome, Deferred, LeaseGetOutcome, LeaseSetOutcome, Pipeline},
    session::Session,
};

/// key backing the server-side CAS counter, incremented once per lease granted.
pub const NEXT_CAS_KEY: &str = "__next_cas";

const LEASE_GET_SCRIPT: &str = r#"
local result = {}
for i = 1, #KEYS do
    local resp = redis.call('GET', KEYS[i])
    if resp then
        result[i] = resp
    else
        local cas = redis.call('INCR', '__next_cas')
        local body = 'cas:' .. cas
        redis.call('SET', KEYS[i], body, 'EX', 3)
        result[i] = body
    end
end
return result
"#;

const LEASE_SET_SCRIPT: &str = r#"
local result = {}
local n = #KEYS
for i = 1, n do
    local base = (i - 1) * 3
    local cas = ARGV[base + 1]
    local val = ARGV[base + 2]
    local ttl = ARGV[base + 3]
    local resp = redis.call('GET', KEYS[i])
    if not resp then
        result[i] = 'NF'
    elseif resp ~= ('cas:' .. cas) then
        result[i] = 'EX'
    else
        redis.call('SET', KEYS[i], 'val:' .. val, 'EX', ttl)
        result[i] = 'OK'
    end
end
return result
"#;

struct SetEntry {
    key: String,
    cas: u64,
    data: Vec<u8>,
    ttl: u64,
}

/// one round of accumulated calls. lives past the pipeline's own flush continuation
/// because a [`Deferred`] holds its own `Rc` clone independent of the pipeline.
struct PendingBatch {
    get_keys: Vec<String>,
    get_result: Vec<LeaseGetOutcome>,
    set_entries: Vec<SetEntry>,
    set_result: Vec<LeaseSetOutcome>,
    delete_keys: Vec<String>,
    delete_result: Vec<DeleteOutcome>,
    flush_scheduled: bool,
    completed: bool,
}

impl PendingBatch {
    fn new() -> Self {
        Self {
            get_keys: Vec::new(),
            get_result: Vec::new(),
            set_entries: Vec::new(),
            set_result: Vec::new(),
            delete_keys: Vec::new(),
            delete_result: Vec::new(),
            flush_scheduled: false,
            completed: false,
        }
    }
}

/// a cache server reachable over a blocking `redis` connection.
///
/// connections are cheap to share: [`RedisClient::pipeline`] hands every pipeline it
/// creates the same `Rc<RefCell<Connection>>`, matching how several request-scoped
/// pipelines from one thread may round-trip against one backing connection.
pub struct RedisClient {
    conn: Rc<RefCell<redis::Connection>>,
    lease_get_script: Rc<Script>,
    lease_set_script: Rc<Script>,
    config: Config,
}

impl RedisClient {
    /// open a connection to `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub fn open(url: &str, config: Config) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        Ok(Self {
            conn: Rc::new(RefCell::new(conn)),
            lease_get_script: Rc::new(Script::new(LEASE_GET_SCRIPT)),
            lease_set_script: Rc::new(Script::new(LEASE_SET_SCRIPT)),
            config,
        })
    }
}

impl CacheClient for RedisClient {
    fn pipeline(&self, sess: Option<Session>) -> Box<dyn Pipeline> {
        Box::new(RedisPipeline {
            conn: self.conn.clone(),
            lease_get_script: self.lease_get_script.clone(),
            lease_set_script: self.lease_set_script.clone(),
            config: self.config,
            sess: sess.unwrap_or_default(),
            current: RefCell::new(None),
        })
    }
}

/// accumulates calls against one [`RedisClient`]'s connection.
pub struct RedisPipeline {
    conn: Rc<RefCell<redis::Connection>>,
    lease_get_script: Rc<Script>,
    lease_set_script: Rc<Script>,
    config: Config,
    sess: Session,
    current: RefCell<Option<Rc<RefCell<PendingBatch>>>>,
}

impl RedisPipeline {
    /// the batch presently accumulating calls. a completed batch left behind by an
    /// earlier flush is treated as absent, so the next call starts a fresh one.
    fn current_batch(&self) -> Rc<RefCell<PendingBatch>> {
        if let Some(batch) = self.current.borrow().as_ref() {
            if !batch.borrow().completed {
                return batch.clone();
            }
        }

        let fresh = Rc::new(RefCell::new(PendingBatch::new()));
        *self.current.borrow_mut() = Some(fresh.clone());
        fresh
    }

    fn schedule_flush(&self, batch: &Rc<RefCell<PendingBatch>>) {
        if batch.borrow().flush_scheduled {
            return;
        }
        batch.borrow_mut().flush_scheduled = true;

        let conn = self.conn.clone();
        let get_script = self.lease_get_script.clone();
        let set_script = self.lease_set_script.clone();
        let max_keys_per_batch = self.config.max_keys_per_batch();
        let batch = batch.clone();
        self.sess
            .add_next_call(move || flush_batch(&conn, &get_script, &set_script, max_keys_per_batch, &batch));
    }
}

impl Pipeline for RedisPipeline {
    fn lease_get(&self, key: &str) -> Deferred<LeaseGetOutcome> {
        let batch = self.current_batch();
        let index = {
            let mut b = batch.borrow_mut();
            let index = b.get_keys.len();
            b.get_keys.push(key.to_owned());
            index
        };
        self.schedule_flush(&batch);

        let sess = self.sess.clone();
        Box::new(move || {
            sess.execute();
            batch.borrow().get_result[index].clone()
        })
    }

    fn lease_set(&self, key: &str, cas: u64, data: Vec<u8>) -> Deferred<LeaseSetOutcome> {
        let ttl = if self.config.min_ttl() == self.config.max_ttl() {
            self.config.min_ttl()
        } else {
            rand::thread_rng().gen_range(self.config.min_ttl()..=self.config.max_ttl())
        };

        let batch = self.current_batch();
        let index = {
            let mut b = batch.borrow_mut();
            let index = b.set_entries.len();
            b.set_entries.push(SetEntry {
                key: key.to_owned(),
                cas,
                data,
                ttl,
            });
            index
        };
        self.schedule_flush(&batch);

        let sess = self.sess.clone();
        Box::new(move || {
            sess.execute();
            batch.borrow().set_result[index].clone()
        })
    }

    fn delete(&self, key: &str) -> Deferred<DeleteOutcome> {
        let batch = self.current_batch();
        let index = {
            let mut b = batch.borrow_mut();
            let index = b.delete_keys.len();
            b.delete_keys.push(key.to_owned());
            index
        };
        self.schedule_flush(&batch);

        let sess = self.sess.clone();
        Box::new(move || {
            sess.execute();
            batch.borrow().delete_result[index].clone()
        })
    }

    fn lower_session(&self) -> Session {
        self.sess.get_lower()
    }

    fn finish(&self) {
        if let Some(batch) = self.current.borrow().clone() {
            flush_batch(
                &self.conn,
                &self.lease_get_script,
                &self.lease_set_script,
                self.config.max_keys_per_batch(),
                &batch,
            );
        }
    }
}

/// run the accumulated gets, then sets, then deletes against the connection, or poison
/// every outcome in the batch with one message if the round trip itself fails.
fn flush_batch(
    conn: &Rc<RefCell<redis::Connection>>,
    get_script: &Script,
    set_script: &Script,
    max_keys_per_batch: usize,
    batch: &Rc<RefCell<PendingBatch>>,
) {
    let mut b = batch.borrow_mut();
    if b.completed {
        return;
    }

    if let Err(e) = run_flush(conn, get_script, set_script, max_keys_per_batch, &mut b) {
        let msg = e.to_string();
        b.get_result = b.get_keys.iter().map(|_| LeaseGetOutcome::Error(msg.clone())).collect();
        b.set_result = b
            .set_entries
            .iter()
            .map(|_| LeaseSetOutcome::Error(msg.clone()))
            .collect();
        b.delete_result = b
            .delete_keys
            .iter()
            .map(|_| DeleteOutcome::Error(msg.clone()))
            .collect();
    }

    b.completed = true;
}

fn run_flush(
    conn: &Rc<RefCell<redis::Connection>>,
    get_script: &Script,
    set_script: &Script,
    max_keys_per_batch: usize,
    batch: &mut PendingBatch,
) -> Result<(), Error> {
    let chunk_size = max_keys_per_batch.max(1);
    let mut conn = conn.borrow_mut();

    let mut get_result = Vec::with_capacity(batch.get_keys.len());
    for chunk in batch.get_keys.chunks(chunk_size) {
        let mut invocation = get_script.prepare_invoke();
        for key in chunk {
            invocation.key(key);
        }
        let raw: Vec<Vec<u8>> = invocation.invoke(&mut *conn)?;
        get_result.extend(raw.iter().map(|body| decode_get_body(body)));
    }
    batch.get_result = get_result;

    let mut set_result = Vec::with_capacity(batch.set_entries.len());
    for chunk in batch.set_entries.chunks(chunk_size) {
        let mut invocation = set_script.prepare_invoke();
        for entry in chunk {
            invocation.key(&entry.key);
        }
        for entry in chunk {
            invocation.arg(entry.cas).arg(&entry.data).arg(entry.ttl);
        }
        let raw: Vec<String> = invocation.invoke(&mut *conn)?;
        set_result.extend(raw.iter().map(|reply| match reply.as_str() {
            "OK" => LeaseSetOutcome::Ok,
            "NF" => LeaseSetOutcome::NotFound,
            "EX" => LeaseSetOutcome::CasMismatch,
            other => LeaseSetOutcome::Error(format!("unexpected lease-set reply: {other}")),
        }));
    }
    batch.set_result = set_result;

    let mut delete_result = Vec::with_capacity(batch.delete_keys.len());
    for chunk in batch.delete_keys.chunks(chunk_size) {
        let mut pipe = redis::pipe();
        for key in chunk {
            pipe.cmd("DEL").arg(key);
        }
        let counts: Vec<i64> = pipe.query(&mut *conn)?;
        delete_result.extend(
            counts
                .into_iter()
                .map(|n| if n > 0 { DeleteOutcome::Ok } else { DeleteOutcome::NotFound }),
        );
    }
    batch.delete_result = delete_result;

    Ok(())
}
