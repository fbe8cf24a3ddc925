pub mod expression;
pub mod files;
pub mod instrumentation;
pub mod nested;
pub mod orchestrator;
pub mod permissions;
pub mod rules;
pub mod scheduler;
pub mod slugs;
pub mod state_machines;
pub mod webhooks;
pub mod workflows;
