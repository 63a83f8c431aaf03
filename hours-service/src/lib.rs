//! Hours-service: maintenance-plan hours bank and change-request admission
//! for the SeeZee client portal.

pub mod config;
pub mod gate;
pub mod grpc;
pub mod ledger;
pub mod models;
pub mod presentation;
pub mod services;
pub mod startup;
