//! Cross-crate end-to-end scenarios live in `tests/`.
//!
//! This crate has no library surface of its own.

#![deny(unsafe_code)]
#![deny(clippy::all)]
