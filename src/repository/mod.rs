pub mod bootstrap;
pub mod metadata;
pub mod table_service;
