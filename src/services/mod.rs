//! Application services layered on top of the domain (C4, C7, C8).

pub mod quota_service;
pub mod rule_service;
pub mod status_service;
