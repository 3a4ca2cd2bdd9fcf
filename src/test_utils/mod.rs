//! Shared fixtures and stubs for tests.
