//! Member-side controllers for fleet networking
//!
//! * [`serviceexport`] turns a user's ServiceExport into a claim in the hub
//! * [`internalserviceexport`] reports the hub's conflict decision back
//! * [`internalmembercluster`] starts and stops the other controllers as the
//!   member joins and leaves the fleet

#![deny(missing_docs)]

pub mod gated;
pub mod internalmembercluster;
pub mod internalserviceexport;
pub mod serviceexport;

pub use gated::{ControllerFactory, GatedController};
pub use internalmembercluster::{MemberController, MembershipContext};
pub use internalserviceexport::ReporterContext;
pub use serviceexport::ServiceExportContext;
