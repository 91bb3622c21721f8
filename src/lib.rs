//! # SpotDB
//!
//! **An ephemeral, single-node SQL sandbox for AI agents.**
//!
//! SpotDB serves an embedded analytical column store (DuckDB) over three
//! concurrent transports. Clients upload CSV files which are auto-typed and
//! materialized as queryable tables, then run SQL over HTTP, WebSocket, or
//! MCP. The database lives in a per-process temporary file and is destroyed
//! on shutdown; optionally it is seeded from, or snapshotted to, an
//! S3-compatible object store.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐  ┌────────────┐  ┌────────────┐
//!  │ HTTP :8080 │  │  WS :6033  │  │ MCP :8081  │
//!  │ upload/SQL │  │ JSON frames│  │ tools/memo │
//!  └─────┬──────┘  └─────┬──────┘  └─────┬──────┘
//!        │               │               │
//!        └───────────────┼───────────────┘
//!                        ▼
//!                 ┌─────────────┐      ┌───────────┐
//!                 │  DB façade  │◀────▶│  DuckDB   │
//!                 │  (db)       │      │ temp file │
//!                 └─────┬───────┘      └───────────┘
//!                       │ seeds / snapshots
//!                       ▼
//!                 ┌─────────────┐
//!                 │  S3 client  │
//!                 └─────────────┘
//! ```
//!
//! ## Upload data flow
//!
//! 1. The HTTP surface ([`server`]) binds the multipart form and spools the
//!    file part.
//! 2. The ingestion pipeline ([`ingest`]) sniffs the MIME type and streams
//!    the data through the bounded copier ([`copy`]), which frames lines and
//!    runs the validators ([`validators`]): encoding, CSV structure, and the
//!    injection screen.
//! 3. The database façade ([`db`]) materializes the table with the engine's
//!    native CSV reader and reports columns and row count back.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-derived configuration |
//! | [`error`] | API error codes, detail objects, status mapping |
//! | [`validators`] | Encoding, CSV structure, and injection screening |
//! | [`copy`] | Bounded line-framed copy with per-line validation |
//! | [`db`] | DuckDB façade: engine actor, query surface, cleanup worker |
//! | [`ingest`] | CSV ingestion orchestration |
//! | [`server`] | HTTP API (Axum): routes, middlewares, rate limit |
//! | [`socket`] | WebSocket query surface |
//! | [`mcp`] | MCP tools, memo resource, and demo prompt |
//! | [`snapshot`] | S3 client (SigV4) for snapshot seed/store |

pub mod config;
pub mod copy;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mcp;
pub mod server;
pub mod snapshot;
pub mod socket;
pub mod validators;
