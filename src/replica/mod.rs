//! Read-replica routing: declared replica descriptors, runtime health
//! state, load-balancing strategies, and the fleet-wide manager
//! (`spec.md` §4.10–§4.14).

pub mod balancer;
pub mod descriptor;
pub mod info;
pub mod manager;
pub mod stats;
