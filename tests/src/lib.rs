//! Integration test support for the ltemme EPC core
#![allow(missing_docs)]
//!
//! This crate provides shared fixtures for the end-to-end tests: a
//! configured engine, canned identities and authentication vectors, and
//! drivers that walk a UE through the attach signalling up to a chosen
//! point.
//!
//! # Test Categories
//!
//! 1. **Attach flows** - complete registrations, identity resolution,
//!    re-attach and collision handling
//! 2. **Failure paths** - authentication failures, rollbacks, timer
//!    exhaustion and lower-layer loss
//! 3. **EMM task** - the async actor wrapping around the engine

pub mod test_utils;

pub use test_utils::{
    assert_nas, attach_ies, complete_attach, drive_to_accept, init_test_logging, test_imsi,
    test_router, ue_manager, vectors, TEST_IMSI,
};
