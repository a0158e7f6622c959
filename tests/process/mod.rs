//! Stage process tests.

mod handle_test;
mod reader_test;
