#![allow(clippy::style)]
#![allow(clippy::complexity)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::mutable_key_type)]
#![allow(clippy::stable_sort_primitive)]
#![allow(clippy::map_entry)]
#![allow(clippy::box_default)]
#![warn(clippy::bool_comparison)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::no_effect)]
#![warn(clippy::unnecessary_unwrap)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::todo)]
#![warn(clippy::wildcard_dependencies)]
#![warn(clippy::zero_prefixed_literal)]
#![warn(clippy::borrowed_box)]
#![warn(clippy::deref_addrof)]
#![warn(clippy::double_must_use)]
#![warn(clippy::double_parens)]
#![warn(clippy::extra_unused_lifetimes)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_question_mark)]
#![warn(clippy::needless_return)]
#![warn(clippy::redundant_pattern)]
#![warn(clippy::redundant_slicing)]
#![warn(clippy::redundant_static_lifetimes)]
#![warn(clippy::single_component_path_imports)]
#![warn(clippy::unnecessary_cast)]
#![warn(clippy::useless_asref)]
#![warn(clippy::useless_conversion)]
#![warn(clippy::builtin_type_shadow)]
#![warn(clippy::duplicate_underscore_argument)]
#![warn(double_negations)]
#![warn(clippy::unnecessary_mut_passed)]
#![warn(clippy::wildcard_in_or_patterns)]
#![warn(clippy::crosspointer_transmute)]
#![warn(clippy::excessive_precision)]
#![warn(clippy::panicking_overflow_checks)]
#![warn(clippy::as_conversions)]
#![warn(clippy::match_overlapping_arm)]
#![warn(clippy::zero_divided_by_zero)]
#![warn(clippy::must_use_unit)]
#![warn(clippy::suspicious_assignment_formatting)]
#![warn(clippy::suspicious_else_formatting)]
#![warn(clippy::suspicious_unary_op_formatting)]
#![warn(clippy::mut_mutex_lock)]
#![warn(clippy::print_literal)]
#![warn(clippy::same_item_push)]
#![warn(clippy::useless_format)]
#![warn(clippy::write_literal)]
#![warn(clippy::redundant_closure)]
#![warn(clippy::redundant_closure_call)]
#![warn(clippy::unnecessary_lazy_evaluations)]
#![warn(clippy::partialeq_ne_impl)]
#![warn(clippy::redundant_field_names)]
#![warn(clippy::transmutes_expressible_as_ptr_casts)]
#![warn(clippy::unused_async)]
#![warn(clippy::disallowed_methods)]
#![warn(clippy::disallowed_macros)]
#![warn(clippy::disallowed_types)]
#![warn(clippy::from_over_into)]

//! This crate implements a level-triggered reconciliation controller for a
//! single logical resource. Changes to any watched collection are coalesced
//! into one [`ReconciliationTarget`] key on a deduplicating, rate-limited
//! [`WorkQueue`]; a [`Controller`] drains that queue with a pool of workers,
//! calling a [`Reconciler`] that re-reads current state and applies
//! idempotent corrections.
//!
//! The pieces compose in a fixed order:
//!
//! 1. an [`Informer`] mirrors a watch feed into a local [`Store`] and
//!    notifies subscribers of every add, update, delete, and periodic resync;
//! 2. a [`Coalescer`] subscribed to every informer queues the same key for
//!    every change;
//! 3. the [`Controller`] waits for every informer to finish its initial list,
//!    then runs workers until stopped;
//! 4. the reconciler writes owned resources through [`apply`], which only
//!    issues a write when the live object differs.
//!
//! [`Operator`] wires these together for the example operator in
//! [`operator`], which keeps a Secret in sync with the spec held in a
//! ConfigMap. It can run against any [`ObjectClient`]; here it runs against
//! the in-memory client:
//!
//! ```no_run
//! # use k8s_openapi::api::core::v1::{ConfigMap, Secret};
//! # use singleton_controller::client::memory::MemoryClient;
//! # use singleton_controller::{ControllerConfig, Operator};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), singleton_controller::Error> {
//! let config_maps = MemoryClient::<ConfigMap>::new();
//! let secrets = MemoryClient::<Secret>::new();
//! let operator = Operator::new(
//!     config_maps.clone(),
//!     secrets.clone(),
//!     ControllerConfig::default(),
//! );
//!
//! let stop = CancellationToken::new();
//! operator
//!     .run(config_maps.watch(), secrets.watch(), stop)
//!     .await
//! # }
//! ```
//!
//! Against a cluster, [`kubernetes::run_operator`] does the same with
//! clients and feeds backed by [`kube`]:
//!
//! ```no_run
//! # use kube::{Client, Config};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let kube_config = Config::infer().await?;
//! let client = Client::try_from(kube_config)?;
//! let stop = CancellationToken::new();
//! singleton_controller::kubernetes::run_operator(
//!     client,
//!     singleton_controller::ControllerConfig::default(),
//!     stop,
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod apply;
pub mod cache;
pub mod client;
pub mod coalesce;
mod config;
mod controller;
mod error;
pub mod kubernetes;
pub mod operator;
pub mod queue;
pub mod version;

pub use apply::{apply, Applied, Apply};
pub use cache::{Change, EventHandler, FeedEvent, Informer, ObjectKey, Store};
pub use client::ObjectClient;
pub use coalesce::{Coalescer, ReconciliationTarget};
pub use config::ControllerConfig;
pub use controller::{Controller, ControllerState, Reconciler};
pub use error::{Aggregate, BoxError, Error};
pub use operator::{ExampleOperator, Operator};
pub use queue::{RateLimiter, WorkQueue};
pub use version::VersionRange;
