use std::any::Any;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{Event, Host, HostObject, ObjectId};

/// A script-level function or method: receives the host and string arguments.
pub type HostCallback = Arc<dyn Fn(&SimHost, &[String]) + Send + Sync>;

struct Slot {
    object: Arc<dyn HostObject>,
    methods: HashMap<String, HostCallback>,
}

struct Scheduled {
    at_ms: u64,
    seq: u64,
    target: ObjectId,
    event: Event,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.at_ms == other.at_ms && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest (time, submission) first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at_ms
            .cmp(&self.at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Plain registry object, used as a callback target.
pub struct ScriptObject {
    class: &'static str,
}

impl HostObject for ScriptObject {
    fn class_name(&self) -> &'static str {
        self.class
    }

    fn process_event(&self, _host: &dyn Host, event: Event) {
        debug!(class = self.class, ?event, "script object ignores engine event");
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Single-threaded cooperative host with a virtual clock.
///
/// Any thread may schedule events; they cross over a channel and are
/// delivered only when the host thread calls [`SimHost::process_events`] (or
/// one of the waiting variants), in `(time, submission)` order. Callbacks run
/// with no internal lock held, so they may call back into the host.
pub struct SimHost {
    clock: AtomicU64,
    next_id: AtomicU32,
    next_seq: AtomicU64,
    objects: Mutex<HashMap<ObjectId, Slot>>,
    functions: Mutex<HashMap<String, HostCallback>>,
    inbox_tx: Sender<Scheduled>,
    inbox_rx: Receiver<Scheduled>,
    pending: Mutex<BinaryHeap<Scheduled>>,
}

impl SimHost {
    pub fn new() -> Self {
        let (inbox_tx, inbox_rx) = unbounded();
        Self {
            clock: AtomicU64::new(0),
            next_id: AtomicU32::new(1),
            next_seq: AtomicU64::new(0),
            objects: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            inbox_tx,
            inbox_rx,
            pending: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Moves the clock forward and returns the new time.
    pub fn advance(&self, ms: u64) -> u64 {
        self.clock.fetch_add(ms, AtomicOrdering::SeqCst) + ms
    }

    pub fn define_function<F>(&self, name: &str, callback: F)
    where
        F: Fn(&SimHost, &[String]) + Send + Sync + 'static,
    {
        self.functions
            .lock()
            .insert(name.to_string(), Arc::new(callback));
    }

    /// Attaches a method to a registered object. Returns false if `object` is unknown.
    pub fn define_method<F>(&self, object: ObjectId, name: &str, callback: F) -> bool
    where
        F: Fn(&SimHost, &[String]) + Send + Sync + 'static,
    {
        let mut objects = self.objects.lock();
        match objects.get_mut(&object) {
            Some(slot) => {
                slot.methods.insert(name.to_string(), Arc::new(callback));
                true
            }
            None => false,
        }
    }

    pub fn create_object(&self, class: &'static str) -> ObjectId {
        self.register_object(Arc::new(ScriptObject { class }))
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.lock().contains_key(&id)
    }

    /// Events scheduled but not yet delivered, due or not.
    pub fn pending_events(&self) -> usize {
        self.collect_inbox();
        self.pending.lock().len()
    }

    /// Delivers every event due at the current time, including ones scheduled
    /// while delivering. Returns how many were delivered.
    pub fn process_events(&self) -> usize {
        let mut delivered = 0;
        while let Some(next) = self.pop_due() {
            self.dispatch(next);
            delivered += 1;
        }
        delivered
    }

    /// Like [`SimHost::process_events`], but blocks up to `timeout` for an
    /// event to arrive when none is due.
    pub fn wait_for_events(&self, timeout: Duration) -> usize {
        let delivered = self.process_events();
        if delivered > 0 {
            return delivered;
        }
        match self.inbox_rx.recv_timeout(timeout) {
            Ok(scheduled) => {
                self.pending.lock().push(scheduled);
                self.process_events()
            }
            Err(_) => 0,
        }
    }

    /// Pumps events until `done` holds or `timeout` passes.
    pub fn run_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            self.process_events();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.wait_for_events((deadline - now).min(Duration::from_millis(10)));
        }
    }

    fn collect_inbox(&self) {
        let mut pending = self.pending.lock();
        for scheduled in self.inbox_rx.try_iter() {
            pending.push(scheduled);
        }
    }

    fn pop_due(&self) -> Option<Scheduled> {
        self.collect_inbox();
        let now = self.now_ms();
        let mut pending = self.pending.lock();
        if pending.peek().is_some_and(|next| next.at_ms <= now) {
            pending.pop()
        } else {
            None
        }
    }

    fn dispatch(&self, scheduled: Scheduled) {
        match self.find_object(scheduled.target) {
            Some(object) => object.process_event(self, scheduled.event),
            None => warn!(
                target_id = %scheduled.target,
                event = ?scheduled.event,
                "event target not found; event dropped"
            ),
        }
    }
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for SimHost {
    fn now_ms(&self) -> u64 {
        self.clock.load(AtomicOrdering::SeqCst)
    }

    fn register_object(&self, object: Arc<dyn HostObject>) -> ObjectId {
        let id = ObjectId::new(self.next_id.fetch_add(1, AtomicOrdering::SeqCst));
        object.on_register(id);
        self.objects.lock().insert(
            id,
            Slot {
                object,
                methods: HashMap::new(),
            },
        );
        id
    }

    fn delete_object(&self, id: ObjectId) -> bool {
        let removed = self.objects.lock().remove(&id);
        match removed {
            Some(slot) => {
                slot.object.on_remove();
                true
            }
            None => false,
        }
    }

    fn find_object(&self, id: ObjectId) -> Option<Arc<dyn HostObject>> {
        self.objects
            .lock()
            .get(&id)
            .map(|slot| Arc::clone(&slot.object))
    }

    fn schedule_event(&self, target: ObjectId, event: Event, at_ms: u64) {
        let seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        // The receiver lives as long as `self`, so the send cannot fail.
        let _ = self.inbox_tx.send(Scheduled {
            at_ms,
            seq,
            target,
            event,
        });
    }

    fn is_callable_method(&self, object: ObjectId, name: &str) -> bool {
        self.objects
            .lock()
            .get(&object)
            .is_some_and(|slot| slot.methods.contains_key(name))
    }

    fn is_function(&self, name: &str) -> bool {
        self.functions.lock().contains_key(name)
    }

    fn invoke_callback(&self, target: Option<ObjectId>, name: &str, args: &[String]) -> bool {
        let callback = match target {
            Some(id) => self
                .objects
                .lock()
                .get(&id)
                .and_then(|slot| slot.methods.get(name).cloned()),
            None => self.functions.lock().get(name).cloned(),
        };
        match callback {
            Some(callback) => {
                callback(self, args);
                true
            }
            None => false,
        }
    }
}

impl Drop for SimHost {
    fn drop(&mut self) {
        let objects = std::mem::take(&mut *self.objects.lock());
        for (_, slot) in objects {
            slot.object.on_remove();
        }
    }
}
