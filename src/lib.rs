//! # Field Audit
//!
//! Local-first engine for auditing field-inspection photo sets with a remote
//! vision model.
//!
//! A project is a folder tree of photos. Each folder is sent to the model at
//! most once per distinct set of images: verdicts are cached under a content
//! fingerprint of the folder's direct images, so re-running the audit only
//! pays for folders whose photos changed. Completed analyses are mirrored to
//! a remote history log through a durable local queue.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌────────────────┐
//! │  Import  │──▶│  SharedTree   │◀──│ AnalysisQueue  │──▶ AnalysisClient ──▶ model
//! └──────────┘   └──────┬────────┘   └───────┬────────┘
//!                       │ autosave           │ cache / history
//!                       ▼                    ▼
//!                ┌─────────────────────────────────┐      ┌────────────┐
//!                │   LocalStore (SQLite, WAL)      │─────▶│ SyncMirror │──▶ remote
//!                │ sessions · cache · sync_queue   │      └────────────┘
//!                └─────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite [`LocalStore`](field_audit_core::store::LocalStore) |
//! | [`cancel`] | Cooperative cancellation signal |
//! | [`transport`] | Remote vision-model transport |
//! | [`analysis`] | Image preparation, prompt, retry policy |
//! | [`sync`] | Remote history mirror |
//! | [`state`] | Per-session project tree container |
//! | [`queue`] | Bounded-concurrency analysis queue |
//! | [`progress`] | Queue progress reporting |
//! | [`session`] | Session restore and autosave |
//! | [`export`] | Per-folder result export |
//! | [`app`] | Session wiring |
//!
//! Tree, fingerprint, policy and storage-trait types live in
//! [`field_audit_core`].

pub mod analysis;
pub mod app;
pub mod cancel;
pub mod config;
pub mod db;
pub mod export;
pub mod migrate;
pub mod progress;
pub mod queue;
pub mod session;
pub mod sqlite_store;
pub mod state;
pub mod sync;
pub mod transport;
