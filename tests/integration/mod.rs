//! Integration tests for oci-inventory
//!
//! Each module drives [`oci_inventory::Scanner`] end to end against one kind
//! of image source, using fixtures built on the fly by [`common`].

pub mod common;
pub mod filesystem;
pub mod registry;
