use std::collections::BTreeMap;

use super::Param;
use crate::core::{DbError, Result, Value};

/// Values for a query invocation. Derived queries bind positionally in
/// signature order; literal queries may use names, positions or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    positional: Vec<Value>,
    named: BTreeMap<String, Value>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self {
            positional: values.into_iter().map(Into::into).collect(),
            named: BTreeMap::new(),
        }
    }

    /// Appends the next positional value.
    pub fn push(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, param: &Param) -> Result<&Value> {
        match param {
            Param::Named(name) => self
                .named
                .get(name)
                .ok_or_else(|| DbError::MissingParameter(name.clone())),
            Param::Positional(index) => index
                .checked_sub(1)
                .and_then(|slot| self.positional.get(slot))
                .ok_or_else(|| DbError::MissingParameter(format!("?{}", index))),
        }
    }

    pub fn positional_len(&self) -> usize {
        self.positional.len()
    }
}

impl From<()> for Params {
    fn from(_: ()) -> Self {
        Params::new()
    }
}

impl From<Vec<Value>> for Params {
    fn from(values: Vec<Value>) -> Self {
        Params::positional(values)
    }
}

/// Positional parameters in signature order.
///
/// ```
/// use entity_session::params;
/// let params = params!["AAA", 15];
/// assert_eq!(params.positional_len(), 2);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::statement::Params::new()
    };
    ($($value:expr),+ $(,)?) => {
        $crate::statement::Params::new()$(.push($value))+
    };
}
