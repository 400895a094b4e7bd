//! Command-line interface for app_compose

use argh::FromArgs;

/// Start native and containerized development apps in dependency order
#[derive(FromArgs, Debug)]
pub struct ComposeArgs {
    /// path to the compose file (default: app-compose.yaml)
    #[argh(positional, default = "String::from(\"app-compose.yaml\")")]
    pub compose_file: String,

    /// validate compose file and exit
    #[argh(switch)]
    pub validate: bool,

    /// remove containers when apps stop instead of keeping them for reuse
    #[argh(switch)]
    pub remove_containers: bool,

    /// prefix for container and volume names (default: working directory name)
    #[argh(option, from_str_fn(parse_project))]
    pub project: Option<String>,

    /// log level (error, warn, info, debug, trace)
    #[argh(option, short = 'l', default = "String::from(\"info\")")]
    pub log_level: String,
}

/// Project prefixes become part of container names
fn parse_project(s: &str) -> Result<String, String> {
    let valid = !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(format!(
            "Invalid project name '{}'. Use letters, digits, '_' or '-'",
            s
        ));
    }
    Ok(s.to_lowercase())
}

impl ComposeArgs {
    /// Log filter for env_logger, falling back to `info`
    pub fn log_filter(&self) -> &'static str {
        match self.log_level.to_lowercase().as_str() {
            "error" => "error",
            "warn" => "warn",
            "info" => "info",
            "debug" => "debug",
            "trace" => "trace",
            _ => "info",
        }
    }
}
