//! Bounded-memory loader for the Receita Federal CNPJ open-data files.
//!
//! A run streams each compressed `;`-delimited source file as fixed-size
//! blocks ([`process::BlockReader`]), coerces the selected columns to their
//! configured types, and hands every block to the [`load::Loader`], which
//! commits it in insert batches. Secondary indexes and planner statistics are
//! built once everything is committed.
//!
//! ```no_run
//! use cnpjload::{config::{EtlConfig, InputSpec}, pipeline::Pipeline};
//!
//! let mut config = EtlConfig::default();
//! config.database = "data/cnpj.db".into();
//! config.inputs.push(InputSpec::new("empresas", "data/downloads/empresas/*.zip"));
//!
//! let mut pipeline = Pipeline::new(config)?;
//! let report = pipeline.run()?;
//! println!("{} rows inserted", report.inserted());
//! # Ok::<(), cnpjload::error::EtlError>(())
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod history;
pub mod load;
pub mod pipeline;
pub mod process;
pub mod schema;
