//! Integration tests for the ramify workspace live in `tests/`.
