//! Genesis Command Controller binary, exposed as a library so
//! integration tests in `tests/` can exercise the controller/handler
//! wiring against fakes without a live AMQP broker or Docker daemon.

pub mod config;
pub mod controller;
pub mod handler;
pub mod rest;
