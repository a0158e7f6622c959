//! Session and registry tests.

mod registry_test;
mod session_test;
