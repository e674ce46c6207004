//! # neuromorph
//!
//! Ingestion and analysis pipeline for brain morphometry.
//!
//! Batches of DICOM slices are classified into candidate series by their
//! embedded metadata, checked for structural and geometric integrity,
//! moved into content-addressed storage, converted into a single NIfTI
//! volume with a bounded preview image set, and finally measured by a
//! multi-stage external analysis run under one wall-clock budget. Every
//! series flows through the pipeline on its own: a malformed slice or a
//! rejected series never aborts its batch siblings.
//!
//! The crate is organized leaves-first:
//!  - [`intake`]: per-slice metadata extraction, grouping, staging area
//!  - [`validator`]: pure candidate-series validation
//!  - [`store`]: content-addressed slice storage and archival
//!  - [`converter`] / [`volume`]: NIfTI assembly and previews
//!  - [`orchestrator`] / [`toolchain`]: the bounded-time analysis graph
//!  - [`registry`]: the persistence collaborator contract
//!  - [`pipeline`]: ties the above together per patient batch
//!
//! # Examples
//!
//! Stage an upload round, commit it, and analyze a committed series:
//!
//! ```no_run
//! # use neuromorph::config::Config;
//! # use neuromorph::pipeline::{Pipeline, Upload};
//! # use neuromorph::registry::InMemoryRegistry;
//! # use neuromorph::toolchain::FslToolchain;
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pipeline = Pipeline::new(Config::from_env(), InMemoryRegistry::new());
//!
//! let uploads = vec![Upload {
//!     filename: "scan0001.dcm".into(),
//!     bytes: std::fs::read("scan0001.dcm")?,
//! }];
//! pipeline.stage_batch("patient-1", &uploads)?;
//! let report = pipeline.commit_staged("patient-1")?;
//!
//! for disposition in &report.series {
//!     println!("{disposition:?}");
//! }
//!
//! let series = pipeline
//!     .analyze(&FslToolchain::new(), "patient-1", "1.2.840.113619.2.408")
//!     .await?;
//! println!("{}: {:?}", series.status, series.whole_brain_volume);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod converter;
pub mod intake;
pub mod orchestrator;
pub mod pipeline;
pub mod registry;
pub mod series;
pub mod store;
pub mod toolchain;
pub mod validator;
pub mod volume;
