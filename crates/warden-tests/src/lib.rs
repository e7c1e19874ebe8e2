//! Test-only crate: the end-to-end supervisor scenarios live in `tests/`.
