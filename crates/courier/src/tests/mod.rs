//! Test suites for the daemon bootstrap.

mod support;
mod unit;
