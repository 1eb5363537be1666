//! Callable shapes and the dynamic call payload.

use std::sync::Arc;

use serde_json::{Map, Value};
use trackpads_errors::TrackResult;

use crate::session::Tracker;
use crate::targets::class::{ClassDef, Instance};

/// Shape of a tracked callable. The wrapping engine and the dispatcher are
/// state machines over this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    /// Bare function in a module.
    Free,
    /// Function in a class dict, bound to an instance at call time.
    Method,
    /// Bound to the class object itself.
    Class,
    /// Unbound function that happens to live in a class dict.
    Static,
    /// Property getter; wrapping covers the getter only.
    Property,
    /// Attribute-guarded descriptor; resolved against the receiver before
    /// the wrapper runs.
    Descriptor,
    /// Constructor. The owning class is recorded as wrapped alongside it.
    Init,
}

impl CallShape {
    /// Whether calls of this shape carry a receiver.
    pub fn takes_receiver(&self) -> bool {
        matches!(
            self,
            CallShape::Method
                | CallShape::Class
                | CallShape::Property
                | CallShape::Descriptor
                | CallShape::Init
        )
    }
}

/// Positional and keyword arguments of a dispatch. Serializable so worker
/// payloads can carry argument bags across the process boundary.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl CallArgs {
    pub fn positional<I: IntoIterator<Item = Value>>(args: I) -> Self {
        Self {
            args: args.into_iter().collect(),
            kwargs: Map::new(),
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.kwargs.insert(key.to_string(), value);
        self
    }
}

/// The receiver a bound call resolves against.
#[derive(Clone)]
pub enum Receiver {
    Instance(Arc<Instance>),
    Class(Arc<ClassDef>),
}

impl Receiver {
    /// Identity used by recursion and duplicate-hook guards.
    pub fn identity(&self) -> u64 {
        match self {
            Receiver::Instance(instance) => instance.id(),
            Receiver::Class(class) => class.id(),
        }
    }

    pub fn instance(&self) -> Option<&Arc<Instance>> {
        match self {
            Receiver::Instance(instance) => Some(instance),
            Receiver::Class(_) => None,
        }
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Receiver::Instance(instance) => {
                write!(f, "Instance#{} of {}", instance.id(), instance.class().path())
            }
            Receiver::Class(class) => write!(f, "Class {}", class.path()),
        }
    }
}

/// Everything a native target function sees when invoked.
pub struct CallEnv<'a> {
    pub tracker: &'a Arc<Tracker>,
    pub receiver: Option<Receiver>,
    pub args: &'a CallArgs,
}

impl<'a> CallEnv<'a> {
    /// The receiving instance, for `Method`/`Init`/`Property` shapes.
    pub fn instance(&self) -> Option<&Arc<Instance>> {
        self.receiver.as_ref().and_then(Receiver::instance)
    }
}

/// A target implementation supplied by the tracked library.
pub type NativeFn = Arc<dyn for<'a> Fn(CallEnv<'a>) -> TrackResult<Value> + Send + Sync>;

/// What a member slot currently points at: the pristine target or the
/// dispatcher the wrapping engine installed over it.
#[derive(Clone)]
pub enum SlotTarget {
    Native(NativeFn),
    Wrapped(Arc<crate::wrapping::Dispatcher>),
}

impl SlotTarget {
    pub fn is_wrapped(&self) -> bool {
        matches!(self, SlotTarget::Wrapped(_))
    }

    /// The pristine callable regardless of wrapping.
    pub fn original(&self) -> NativeFn {
        match self {
            SlotTarget::Native(native) => Arc::clone(native),
            SlotTarget::Wrapped(dispatcher) => dispatcher.original(),
        }
    }
}
