//! Worker process wiring: settings → broker → handlers → running worker.

pub mod app;
