pub mod api;
pub mod sentry;
