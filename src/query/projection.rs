use crate::core::{DbError, FromValue, Result, Value};

/// A view built directly from selected columns. Views are plain values:
/// the session never tracks them.
pub trait FromRow: Sized {
    /// Number of selected columns the view consumes; checked when the query
    /// is built.
    const ARITY: usize;

    fn from_row(values: &[Value]) -> Result<Self>;
}

fn check_arity(expected: usize, values: &[Value]) -> Result<()> {
    if values.len() != expected {
        return Err(DbError::TypeMismatch(format!(
            "expected {} column(s), got {}",
            expected,
            values.len()
        )));
    }
    Ok(())
}

/// Single-column views: `select m.username from Member m` -> `String`.
impl<T: FromValue> FromRow for T {
    const ARITY: usize = 1;

    fn from_row(values: &[Value]) -> Result<Self> {
        check_arity(1, values)?;
        T::from_value(&values[0])
    }
}

impl<A: FromValue, B: FromValue> FromRow for (A, B) {
    const ARITY: usize = 2;

    fn from_row(values: &[Value]) -> Result<Self> {
        check_arity(2, values)?;
        Ok((A::from_value(&values[0])?, B::from_value(&values[1])?))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue> FromRow for (A, B, C) {
    const ARITY: usize = 3;

    fn from_row(values: &[Value]) -> Result<Self> {
        check_arity(3, values)?;
        Ok((
            A::from_value(&values[0])?,
            B::from_value(&values[1])?,
            C::from_value(&values[2])?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_and_tuple_rows() {
        let name = String::from_row(&[Value::from("member1")]).unwrap();
        assert_eq!(name, "member1");

        let pair = <(i64, Option<String>)>::from_row(&[Value::Integer(3), Value::Null]).unwrap();
        assert_eq!(pair, (3, None));
    }

    #[test]
    fn test_arity_mismatch() {
        assert!(String::from_row(&[]).is_err());
        assert!(<(i64, i64)>::from_row(&[Value::Integer(1)]).is_err());
    }
}
