//! On-disk layout of virtual disks on a datastore

pub mod resolver;

pub use resolver::DatastoreLayoutResolver;
