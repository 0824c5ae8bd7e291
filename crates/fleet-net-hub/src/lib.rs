//! Hub-side controllers for fleet networking
//!
//! * [`serviceimport`] resolves a ServiceImport from the claims exported by
//!   member clusters
//! * [`internalserviceexport`] keeps the resolved cluster list current as
//!   claims come and go

#![deny(missing_docs)]

mod claim;
pub mod internalserviceexport;
pub mod serviceimport;

pub use internalserviceexport::InternalServiceExportContext;
pub use serviceimport::ServiceImportContext;
