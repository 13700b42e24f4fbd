pub mod configuration;
pub mod routes;
pub mod startup;
pub mod use_cases;
