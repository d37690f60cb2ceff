//! Shared types for the multitenant database controller: the registry data model,
//! migration descriptors, installation secrets, and the cloud tag contract used to
//! discover clusters that the registry has not seen yet.
pub mod models;
pub mod secret;
pub mod tags;
