//! Integration tests for the Tier-1 dashboard
//! These run the real HTTP client against local mock servers

pub mod support;

pub mod backend_test;
pub mod dashboard_test;
pub mod keycloak_test;
