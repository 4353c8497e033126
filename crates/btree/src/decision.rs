use crate::types::DataType;

/// Outcome of one [`DecisionMaker::decide`] call. `Abort` and `Repeat`
/// drive the retry loop in `operate`; `Put` and `Remove` commit a change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Abort,
    Remove,
    Put,
    Repeat,
}

/// Steers one `operate` invocation. The update algorithm calls `decide`
/// with the existing and the candidate value; on `Put` the stored value is
/// whatever `select_value` returns. `reset` is called before a retry so a
/// stateful decision maker can forget what it saw.
pub trait DecisionMaker<V> {
    fn decide(&mut self, existing: Option<&V>, candidate: Option<&V>) -> Decision;

    fn select_value(&mut self, _existing: Option<&V>, candidate: Option<&V>) -> Option<V>
    where
        V: Clone,
    {
        candidate.cloned()
    }

    fn reset(&mut self) {}
}

/// Unconditional put.
pub struct PutDecision;

impl<V> DecisionMaker<V> for PutDecision {
    fn decide(&mut self, _existing: Option<&V>, _candidate: Option<&V>) -> Decision {
        Decision::Put
    }
}

/// Unconditional remove.
pub struct RemoveDecision;

impl<V> DecisionMaker<V> for RemoveDecision {
    fn decide(&mut self, _existing: Option<&V>, _candidate: Option<&V>) -> Decision {
        Decision::Remove
    }
}

/// Put only when no value exists yet.
pub struct IfAbsentDecision;

impl<V> DecisionMaker<V> for IfAbsentDecision {
    fn decide(&mut self, existing: Option<&V>, _candidate: Option<&V>) -> Decision {
        if existing.is_some() {
            Decision::Abort
        } else {
            Decision::Put
        }
    }
}

/// Put only when a value already exists.
pub struct IfPresentDecision;

impl<V> DecisionMaker<V> for IfPresentDecision {
    fn decide(&mut self, existing: Option<&V>, _candidate: Option<&V>) -> Decision {
        if existing.is_some() {
            Decision::Put
        } else {
            Decision::Abort
        }
    }
}

/// Proceed only when the existing value equals the expectation; used for
/// compare-and-set replace and conditional remove. Whether the operation
/// puts or removes follows from the candidate being present or not.
pub struct EqualsDecision<T: DataType> {
    value_type: T,
    expected: T::Value,
    /// Whether the last decide matched, so the caller can distinguish
    /// "aborted because unequal" from other aborts.
    matched: bool,
}

impl<T: DataType> EqualsDecision<T> {
    pub fn new(value_type: T, expected: T::Value) -> Self {
        EqualsDecision {
            value_type,
            expected,
            matched: false,
        }
    }

    pub fn matched(&self) -> bool {
        self.matched
    }
}

impl<T: DataType> DecisionMaker<T::Value> for EqualsDecision<T> {
    fn decide(&mut self, existing: Option<&T::Value>, candidate: Option<&T::Value>) -> Decision {
        self.matched = match existing {
            Some(value) => self.value_type.equals(value, &self.expected),
            None => false,
        };
        if !self.matched {
            Decision::Abort
        } else if candidate.is_some() {
            Decision::Put
        } else {
            Decision::Remove
        }
    }

    fn reset(&mut self) {
        self.matched = false;
    }
}
