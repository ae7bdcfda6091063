//! Dev-mode self-analysis.
//!
//! Dev mode swaps the planning prompt for one that points the planner at
//! the orchestrator's own log directory and configuration files. The
//! resulting TODO executes through the normal stages; nothing else is
//! special-cased.

use td_domain::config::Config;

/// Log directory the analysis prompt directs tools at.
pub const LOG_DIR: &str = "./logs";
/// Configuration file the analysis prompt directs tools at.
pub const CONFIG_FILE: &str = "./config/tandem.toml";

/// Build the self-analysis planning prompt.
pub fn analysis_prompt(config: &Config, user_message: &str) -> String {
    let providers = config.providers.enabled_names().join(", ");
    format!(
        "You are planning a self-analysis of this orchestrator process.\n\
         Available capability providers: {providers}.\n\
         Ground every step in the process's own files:\n\
         - log directory: {LOG_DIR}\n\
         - configuration: {CONFIG_FILE}\n\
         Produce a TODO that reads the relevant logs and configuration, \
         looks for errors, slow stages, and misconfiguration, and writes a \
         short report to {LOG_DIR}/analysis.md.\n\n\
         Operator request: {user_message}"
    )
}
