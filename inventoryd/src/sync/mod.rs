pub mod accountant;
pub mod backoff;
pub mod delta;
pub mod fetch;
pub mod model;
pub mod observer;
pub mod queue;
pub mod session;
pub mod snapshot;
pub mod store;
#[cfg(test)]
pub(crate) mod test_support;
