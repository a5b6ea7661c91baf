//! TwinWatch kernel : classification de phases télémétrie, cycle de vie des
//! alertes et routage des événements machine vers les observateurs.

pub mod alerts;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod health;
pub mod http;
pub mod models;
pub mod mqtt;
pub mod phase;
pub mod ports;
pub mod router;
pub mod session;
pub mod state;
