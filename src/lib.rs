//! End-to-end scenario harness. No production code lives here; this crate
//! exists to host `tests/scenarios.rs`, which drives the Receiver, a real
//! job queue worker, and the Forwarder against an in-process mock SCP.
