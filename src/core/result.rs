//! Railway helpers on top of `std::result::Result`.
//!
//! `map`, `map_err` and `and_then` already short-circuit on the first `Err`
//! and never touch the discarded branch. What lives here are the collection
//! helpers and the explicit recovery hook used by error policies.

/// Collect results, stopping at the first failure.
pub fn chain_results<T, E, I>(results: I) -> Result<Vec<T>, E>
where
    I: IntoIterator<Item = Result<T, E>>,
{
    results.into_iter().collect()
}

/// Collect every result. Returns all values, or every error if any failed.
pub fn collect_results<T, E, I>(results: I) -> Result<Vec<T>, Vec<E>>
where
    I: IntoIterator<Item = Result<T, E>>,
{
    let mut values = Vec::new();
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(v) => values.push(v),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(values)
    } else {
        Err(errors)
    }
}

pub trait ResultExt<T, E> {
    /// Turn an `Err` into an `Ok` when `pred` accepts it. Errors the predicate
    /// rejects propagate unchanged.
    fn recover_if<P, F>(self, pred: P, recover: F) -> Result<T, E>
    where
        P: FnOnce(&E) -> bool,
        F: FnOnce(E) -> T;

    /// Observe an error without consuming it.
    fn tap_err<F>(self, f: F) -> Result<T, E>
    where
        F: FnOnce(&E);
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn recover_if<P, F>(self, pred: P, recover: F) -> Result<T, E>
    where
        P: FnOnce(&E) -> bool,
        F: FnOnce(E) -> T,
    {
        match self {
            Err(e) if pred(&e) => Ok(recover(e)),
            other => other,
        }
    }

    fn tap_err<F>(self, f: F) -> Result<T, E>
    where
        F: FnOnce(&E),
    {
        if let Err(e) = &self {
            f(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_and_then_skips_later_stages() {
        let calls = Cell::new(0);
        let stage = |v: i32| -> Result<i32, String> {
            calls.set(calls.get() + 1);
            if v == 2 {
                Err("boom".to_string())
            } else {
                Ok(v + 1)
            }
        };

        let out = Ok(0).and_then(stage).and_then(stage).and_then(stage).and_then(stage);
        assert_eq!(out, Err("boom".to_string()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_map_never_runs_on_err() {
        let touched = Cell::new(false);
        let r: Result<i32, &str> = Err("e");
        let r = r.map(|v| {
            touched.set(true);
            v * 2
        });
        assert_eq!(r, Err("e"));
        assert!(!touched.get());
    }

    #[test]
    fn test_chain_results_first_failure() {
        let out = chain_results(vec![Ok(1), Err("a"), Err("b")]);
        assert_eq!(out, Err("a"));
    }

    #[test]
    fn test_collect_results_gathers_all_errors() {
        let out = collect_results(vec![Ok(1), Err("a"), Ok(2), Err("b")]);
        assert_eq!(out, Err(vec!["a", "b"]));
        let out: Result<Vec<i32>, Vec<&str>> = collect_results(vec![Ok(1), Ok(2)]);
        assert_eq!(out, Ok(vec![1, 2]));
    }

    #[test]
    fn test_recover_if_only_matching_errors() {
        let r: Result<i32, &str> = Err("missing");
        assert_eq!(r.recover_if(|e| *e == "missing", |_| 0), Ok(0));

        let r: Result<i32, &str> = Err("fatal");
        assert_eq!(r.recover_if(|e| *e == "missing", |_| 0), Err("fatal"));
    }

    #[test]
    fn test_tap_err_preserves_error() {
        let seen = Cell::new(0);
        let r: Result<i32, i32> = Err(7);
        let r = r.tap_err(|e| seen.set(*e));
        assert_eq!(r, Err(7));
        assert_eq!(seen.get(), 7);
    }
}
