/// A scriptable node for tests
#[cfg(any(test, feature = "test_utils"))]
pub mod mocks;
