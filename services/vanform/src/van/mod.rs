//! VAN Form
//!
//! Forms a virtual application network across zones by exchanging link
//! tokens through a shared store. Each managed zone instance runs a
//! [`VanFormRunner`] that periodically publishes the tokens other zones
//! need to reach it, then creates or removes local links to match what
//! its peers published.

pub mod handler;
pub mod runner;
pub mod token;
pub mod types;
pub mod vanform;

pub use handler::{secret_still_referenced, ConfigLoader, SiteResolver, TokenHandler};
pub use runner::VanFormRunner;
pub use token::{link_name_for, Endpoint, Link, LinkSpec, Token};
pub use types::{VanConfig, Zone, ZoneList};
pub use vanform::{PassSummary, VanForm};
