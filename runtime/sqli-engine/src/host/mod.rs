//! The host object/event system the engine plugs into.
//!
//! The engine consumes this interface and never implements registration or
//! scheduling itself. [`SimHost`] is an in-process implementation for
//! embedders without an object system of their own.

mod sim;

pub use sim::{HostCallback, ScriptObject, SimHost};

use std::any::Any;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;
use std::sync::Arc;

/// Identity of an object in the host registry. Zero is never handed out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(u32);

impl ObjectId {
    pub const NONE: ObjectId = ObjectId(0);

    pub const fn new(raw: u32) -> Self {
        ObjectId(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ObjectId)
    }
}

/// Events the engine schedules onto the host loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The worker opened the database.
    Initialized,
    /// The worker could not open the database and has exited.
    OpenFailed { code: i32, message: String },
    /// A queued statement failed. Addressed to the engine, never the handle.
    QueryFailed {
        code: i32,
        message: String,
        sql: Arc<str>,
        handle: Option<ObjectId>,
    },
    /// A queued statement finished; ownership of the handle returns to the host.
    QueryCompleted,
    /// Periodic scan for result handles nobody disposed of.
    ExpirySweep,
}

/// An object living in the host registry.
pub trait HostObject: Send + Sync + 'static {
    fn class_name(&self) -> &'static str;

    /// Called once by the host with the id it assigned.
    fn on_register(&self, _id: ObjectId) {}

    /// Called after the host dropped the object from its registry.
    fn on_remove(&self) {}

    /// Runs on the host thread when a scheduled event for this object fires.
    fn process_event(&self, host: &dyn Host, event: Event);

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Host services the engine relies on.
///
/// `schedule_event` must be callable from any thread. Everything else is
/// only called from the host thread.
pub trait Host: Send + Sync {
    /// Host clock in milliseconds; event times and expiry use it.
    fn now_ms(&self) -> u64;

    fn register_object(&self, object: Arc<dyn HostObject>) -> ObjectId;

    /// Removes the object from the registry. Returns false if it was not there.
    fn delete_object(&self, id: ObjectId) -> bool;

    fn find_object(&self, id: ObjectId) -> Option<Arc<dyn HostObject>>;

    fn schedule_event(&self, target: ObjectId, event: Event, at_ms: u64);

    fn is_callable_method(&self, object: ObjectId, name: &str) -> bool;

    fn is_function(&self, name: &str) -> bool;

    /// Invokes a method on `target`, or a global function when `target` is
    /// `None`. Returns false when nothing by that name exists.
    fn invoke_callback(&self, target: Option<ObjectId>, name: &str, args: &[String]) -> bool;
}

/// Looks up `id` and downcasts it to a concrete object type.
pub fn find_as<T: HostObject>(host: &dyn Host, id: ObjectId) -> Option<Arc<T>> {
    host.find_object(id)?.into_any().downcast::<T>().ok()
}
