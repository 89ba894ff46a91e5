//! netdeps: live network-dependency discovery for the containers of one host.
//!
//! The daemon keeps an in-memory view of containers, networks, IPs and veths
//! in sync with the runtime's event stream ([`dispatcher`], [`cache`]),
//! captures each container's egress traffic ([`monitor`], [`capture`]) and
//! records every new directed flow once ([`ledger`]) as a dependency edge in
//! a graph store ([`graph`]).

pub mod cache;
pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod graph;
pub mod ledger;
pub mod monitor;
pub mod retry;
pub mod runtime;
pub mod types;
pub mod veth;
