//! Integration tests of the recovery engine against the in-memory scan service, see `tests/`.
