//! Cogger Server Library
//!
//! HTTP service that turns Sentinel-2 scenes into cloud-optimized GeoTIFF
//! artifacts and serves them back as metadata and map tiles.
//!
//! # Overview
//!
//! One `POST /convert` drives a scene through three stages behind an
//! idempotent job ledger:
//!
//! - **Fetch**: authenticated band downloads from the imagery provider
//! - **Convert**: percentile tone mapping and RGB composition into a tiled,
//!   deflate-compressed artifact with overviews
//! - **Upload**: confirmed write into object storage
//!
//! Read endpoints (`/status`, `/info`, `/tiles`) never trigger work; they
//! observe the ledger and the stored artifacts, opening artifacts with small
//! ranged reads instead of full downloads.
//!
//! ## Framework Stack
//!
//! - **Axum**: HTTP routing and middleware
//! - **SQLx**: PostgreSQL job ledger
//! - **AWS SDK**: S3-compatible object storage

pub mod api;
pub mod cog;
pub mod config;
pub mod convert;
pub mod error;
pub mod fetch;
pub mod ledger;
pub mod middleware;
pub mod pipeline;
pub mod storage;
pub mod tiles;
