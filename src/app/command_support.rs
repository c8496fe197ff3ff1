use crate::config::{load_settings, Settings};
use crate::runtime::{default_state_root_path, RuntimeContext, StatePaths};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Options accepted before the command verb.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    pub state_root: Option<PathBuf>,
}

/// Splits leading `--state-root <path>` off `args`.
pub fn split_global_options(args: &[String]) -> Result<(GlobalOptions, &[String]), String> {
    let mut options = GlobalOptions::default();
    let mut rest = args;
    while let Some(first) = rest.first() {
        if first == "--state-root" {
            let value = rest
                .get(1)
                .ok_or_else(|| "usage: --state-root <path>".to_string())?;
            options.state_root = Some(PathBuf::from(value));
            rest = &rest[2..];
        } else if let Some(value) = first.strip_prefix("--state-root=") {
            options.state_root = Some(PathBuf::from(value));
            rest = &rest[1..];
        } else {
            break;
        }
    }
    Ok((options, rest))
}

pub fn state_paths(options: &GlobalOptions) -> Result<StatePaths, String> {
    let root = match &options.state_root {
        Some(root) => root.clone(),
        None => default_state_root_path().map_err(|e| e.to_string())?,
    };
    Ok(StatePaths::new(root))
}

pub fn load_root_settings(paths: &StatePaths) -> Result<Settings, String> {
    load_settings(&paths.settings_file()).map_err(|e| e.to_string())
}

/// Opens the runtime context with the configured command-line model.
pub fn open_context(options: &GlobalOptions) -> Result<RuntimeContext, String> {
    let paths = state_paths(options)?;
    let settings = load_root_settings(&paths)?;
    RuntimeContext::with_command_model(paths, settings).map_err(|e| e.to_string())
}

/// Parses trailing `key=value` pairs.
pub fn parse_key_values(args: &[String]) -> Result<BTreeMap<String, String>, String> {
    let mut values = BTreeMap::new();
    for raw in args {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
        if key.trim().is_empty() {
            return Err(format!("empty key in `{raw}`"));
        }
        values.insert(key.trim().to_string(), value.to_string());
    }
    Ok(values)
}

pub fn parse_bool(raw: &str, field: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("invalid {field} `{other}`; expected true or false")),
    }
}

/// Comma- or space-separated list, empty items dropped.
pub fn parse_name_list(args: &[String]) -> Vec<String> {
    args.iter()
        .flat_map(|arg| arg.split(','))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn or_none<T: ToString>(value: Option<T>) -> String {
    value
        .map(|value| value.to_string())
        .unwrap_or_else(|| "none".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_root_flag_is_split_from_the_command() {
        let args: Vec<String> = ["--state-root", "/tmp/x", "status"]
            .into_iter()
            .map(str::to_string)
            .collect();
        let (options, rest) = split_global_options(&args).expect("split");
        assert_eq!(options.state_root, Some(PathBuf::from("/tmp/x")));
        assert_eq!(rest, &["status".to_string()]);
    }

    #[test]
    fn name_list_accepts_commas_and_spaces() {
        let args = vec!["a,b".to_string(), " c ".to_string(), ",".to_string()];
        assert_eq!(parse_name_list(&args), vec!["a", "b", "c"]);
    }
}
