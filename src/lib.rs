//! medprice - pharmaceutical wholesale price discovery and monitoring.
//!
//! The engine ingests price data from a wholesale marketplace through a
//! hybrid strategy (JSON endpoints first, a headless browser when endpoint
//! coverage is insufficient), normalizes and classifies what it finds,
//! stores append-only price history with outlier annotations, and serves
//! comparison and procurement analytics over HTTP.

pub mod errors;

pub mod domain {
    //! Pure types and logic: entities, normalization, classification,
    //! outlier statistics, progress events.
    pub mod classifier;
    pub mod entities;
    pub mod events;
    pub mod normalizer;
    pub mod outliers;
}

pub mod infrastructure {
    //! I/O adapters: configuration, logging, the upstream HTTP client,
    //! the browser harvester, and the sqlite repositories.
    pub mod browser_harvester;
    pub mod config;
    pub mod credential_broker;
    pub mod database_connection;
    pub mod drug_repository;
    pub mod http_client;
    pub mod logging;
    pub mod price_repository;
    pub mod task_repository;
    pub mod upstream_client;
}

pub mod application {
    //! Use cases: hybrid acquisition, ingest, batch scheduling, analytics,
    //! and monitor-rule evaluation.
    pub mod acquisition;
    pub mod analytics;
    pub mod ingest;
    pub mod monitor;
    pub mod scheduler;
}

pub mod api {
    //! Operator HTTP surface.
    pub mod handlers;
    pub mod server;
}
