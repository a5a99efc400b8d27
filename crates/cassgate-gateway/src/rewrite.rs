//! Request and response rewriting
//!
//! The ingress side rewrites client packets so every tenant keyspace
//! reference lands in the tenant's prefixed namespace; the egress side
//! strips the prefix back out of responses and filters metadata rows that
//! belong to other tenants.

pub mod filter;
pub mod request;
pub mod response;
pub mod statement;
