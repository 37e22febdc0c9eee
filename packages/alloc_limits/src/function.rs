//! Test callables and their instrumented replacements.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// What a test callable returns: `Ok` if the test passed, the failure otherwise.
///
/// Panics raised by a test are not caught. They unwind through the instrumentation unchanged.
pub type TestResult = Result<(), Box<dyn StdError + Send + Sync>>;

pub(crate) type TestBody = Arc<dyn Fn() -> TestResult + Send + Sync>;

/// A test callable as held by a [`TestItem`][1].
///
/// A function is either the test author's original callable or an instrumented replacement of
/// it. Instrumenting an already instrumented function replaces the existing instrumentation
/// instead of stacking a second layer on top, so repeated wrapping is harmless.
///
/// [1]: crate::TestItem
#[derive(Clone)]
pub struct TestFunction {
    body: TestBody,

    // Set if `body` instruments another callable. Always the uninstrumented original.
    original: Option<TestBody>,
}

impl TestFunction {
    /// Creates a test function from the test's callable.
    ///
    /// # Example
    ///
    /// ```
    /// use alloc_limits::TestFunction;
    ///
    /// let function = TestFunction::new(|| {
    ///     let data = vec![0_u8; 1024];
    ///     assert_eq!(data.len(), 1024);
    ///     Ok(())
    /// });
    ///
    /// function.call().unwrap();
    /// ```
    pub fn new(body: impl Fn() -> TestResult + Send + Sync + 'static) -> Self {
        Self {
            body: Arc::new(body),
            original: None,
        }
    }

    /// Invokes the function, returning the test's result unchanged.
    ///
    /// # Errors
    ///
    /// Returns whatever error the test itself returns.
    pub fn call(&self) -> TestResult {
        (self.body)()
    }

    /// Whether this function is an instrumented replacement of another one.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.original.is_some()
    }

    /// The uninstrumented callable behind this function.
    ///
    /// Returns a clone of `self` if the function is not instrumented.
    #[must_use]
    pub fn original(&self) -> Self {
        match &self.original {
            Some(original) => Self {
                body: Arc::clone(original),
                original: None,
            },
            None => self.clone(),
        }
    }

    /// Whether both values refer to the same callable.
    #[must_use]
    pub fn same_callable(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Builds an instrumented replacement of the original callable behind this function.
    ///
    /// `instrument` receives the uninstrumented original and returns the replacement body.
    pub(crate) fn instrumented_with(&self, instrument: impl FnOnce(Self) -> TestBody) -> Self {
        let original = self.original();
        let original_body = Arc::clone(&original.body);

        Self {
            body: instrument(original),
            original: Some(original_body),
        }
    }
}

impl fmt::Debug for TestFunction {
    #[cfg_attr(test, mutants::skip)] // No API contract.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestFunction")
            .field("instrumented", &self.is_instrumented())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    static_assertions::assert_impl_all!(TestFunction: Send, Sync, Clone);

    fn counting_instrumentation(counter: &Arc<AtomicUsize>) -> impl FnOnce(TestFunction) -> TestBody {
        let counter = Arc::clone(counter);
        move |inner| {
            Arc::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                inner.call()
            })
        }
    }

    #[test]
    fn call_propagates_result() {
        let passing = TestFunction::new(|| Ok(()));
        let failing = TestFunction::new(|| Err("boom".into()));

        passing.call().unwrap();
        assert_eq!(failing.call().unwrap_err().to_string(), "boom");
    }

    #[test]
    fn original_of_plain_function_is_itself() {
        let function = TestFunction::new(|| Ok(()));

        assert!(!function.is_instrumented());
        assert!(function.original().same_callable(&function));
    }

    #[test]
    fn instrumented_function_remembers_original() {
        let counter = Arc::new(AtomicUsize::new(0));
        let function = TestFunction::new(|| Ok(()));

        let instrumented = function.instrumented_with(counting_instrumentation(&counter));

        assert!(instrumented.is_instrumented());
        assert!(!instrumented.same_callable(&function));
        assert!(instrumented.original().same_callable(&function));

        instrumented.call().unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn instrumenting_twice_does_not_stack() {
        let counter = Arc::new(AtomicUsize::new(0));
        let function = TestFunction::new(|| Ok(()));

        let once = function.instrumented_with(counting_instrumentation(&counter));
        let twice = once.instrumented_with(counting_instrumentation(&counter));

        twice.call().unwrap();

        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(twice.original().same_callable(&function));
    }
}
