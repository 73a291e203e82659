//! Outcome classification predicates shared by the circuit breaker and retry
//!
//! Errors are inspected as `&(dyn Error + 'static)` so a predicate can
//! downcast to the concrete type it cares about. Returned values are
//! inspected as `&dyn Any` for the same reason.

use std::any::Any;
use std::error::Error;
use std::sync::Arc;

/// Decides something about an error
pub type ErrorPredicate = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Decides something about a returned value
pub type ResultPredicate = Arc<dyn Fn(&dyn Any) -> bool + Send + Sync>;

/// Matches every error of concrete type `E`
///
/// # Example
/// ```
/// use bulwark_core_resilience::predicate::error_type;
/// use std::io;
///
/// let is_io = error_type::<io::Error>();
/// let err = io::Error::new(io::ErrorKind::Other, "disk");
/// assert!(is_io(&err));
/// ```
pub fn error_type<E: Error + 'static>() -> ErrorPredicate {
    Arc::new(|err| err.downcast_ref::<E>().is_some())
}

/// Matches errors of type `E` for which `test` holds
pub fn error_matching<E, F>(test: F) -> ErrorPredicate
where
    E: Error + 'static,
    F: Fn(&E) -> bool + Send + Sync + 'static,
{
    Arc::new(move |err| err.downcast_ref::<E>().is_some_and(&test))
}

/// Matches returned values of type `T` for which `test` holds
pub fn result_matching<T, F>(test: F) -> ResultPredicate
where
    T: 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    Arc::new(move |value| value.downcast_ref::<T>().is_some_and(&test))
}

/// Matches every error
pub fn any_error() -> ErrorPredicate {
    Arc::new(|_| true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Timeout(u32);

    impl fmt::Display for Timeout {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "timeout after {}ms", self.0)
        }
    }

    impl Error for Timeout {}

    #[test]
    fn test_error_type_downcasts() {
        let pred = error_type::<Timeout>();
        assert!(pred(&Timeout(5)));
        assert!(!pred(&fmt::Error));
    }

    #[test]
    fn test_error_matching() {
        let slow = error_matching(|t: &Timeout| t.0 > 100);
        assert!(slow(&Timeout(500)));
        assert!(!slow(&Timeout(50)));
    }

    #[test]
    fn test_result_matching() {
        let empty = result_matching(|v: &Vec<u8>| v.is_empty());
        assert!(empty(&Vec::<u8>::new()));
        assert!(!empty(&vec![1u8]));
        assert!(!empty(&"not a vec"), "other types never match");
    }
}
