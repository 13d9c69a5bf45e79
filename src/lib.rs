#[macro_use]
extern crate rocket;

pub mod api;
pub mod catalog;
pub mod common;
pub mod config;
pub mod models;
pub mod processing;
pub mod storage;
pub mod utils;
pub mod workflow;

use std::sync::Arc;

use rocket::data::{Limits, ToByteUnit};

use crate::api::handlers::{generate_photo_routes, generate_system_routes};
use crate::catalog::Catalog;
use crate::common::UPLOAD_LIMIT_MIB;
use crate::config::AppConfig;
use crate::storage::ObjectStore;
use crate::workflow::engine::WorkflowEngine;

/// Everything a request handler needs, built once in `main` and handed to
/// Rocket via managed state. No component reaches for package-level
/// singletons.
pub struct AppContext {
    pub config: AppConfig,
    pub store: Arc<dyn ObjectStore>,
    pub catalog: Arc<Catalog>,
    pub engine: Arc<WorkflowEngine>,
}

pub fn build_rocket(context: Arc<AppContext>) -> rocket::Rocket<rocket::Build> {
    let limits = Limits::default()
        .limit("file", UPLOAD_LIMIT_MIB.mebibytes())
        .limit("data-form", UPLOAD_LIMIT_MIB.mebibytes());
    let figment = rocket::Config::figment()
        .merge(("port", context.config.port))
        .merge(("limits", limits));

    rocket::custom(figment)
        .manage(context)
        .mount("/", generate_photo_routes())
        .mount("/", generate_system_routes())
}
