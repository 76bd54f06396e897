//! This module contains utilities for testing code built on RUDP connections without a real
//!  network. They are used for testing this crate itself, but they are also exported for
//!  application testing, which is why they are part of the crate's regular (non-#[cfg(test)])
//!  code.

pub mod sim_network;
pub mod dispatcher;
