//! End-to-end helpers for bridge scenarios: an in-memory relay that speaks
//! the `BridgeTransport` contract and a scripted dApp on the other side.

pub mod harness;
