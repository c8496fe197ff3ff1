#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Init,
    Submit,
    RunTrigger,
    Cancel,
    ResetGate,
    Status,
    Logs,
    Watch,
    Supervise,
    Stop,
    Job,
    Sequence,
    Queue,
    Cycle,
    Schedule,
    Archive,
    Topics,
    Tasks,
    Goals,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "init" => CliVerb::Init,
        "submit" => CliVerb::Submit,
        "run-trigger" => CliVerb::RunTrigger,
        "cancel" => CliVerb::Cancel,
        "reset-gate" => CliVerb::ResetGate,
        "status" => CliVerb::Status,
        "logs" => CliVerb::Logs,
        "watch" => CliVerb::Watch,
        "supervise" => CliVerb::Supervise,
        "stop" => CliVerb::Stop,
        "job" => CliVerb::Job,
        "sequence" => CliVerb::Sequence,
        "queue" => CliVerb::Queue,
        "cycle" => CliVerb::Cycle,
        "schedule" => CliVerb::Schedule,
        "archive" => CliVerb::Archive,
        "topics" => CliVerb::Topics,
        "tasks" => CliVerb::Tasks,
        "goals" => CliVerb::Goals,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

pub fn cli_help_lines() -> Vec<String> {
    [
        "Usage: jobloop [--state-root <path>] <command> ...",
        "",
        "Commands:",
        "  init                                 Create the state root and default job definitions",
        "  submit <text>                        Run one user turn through the job sequence",
        "  run-trigger <job>                    Run a single job outside the sequence",
        "  cancel                               Cancel the turn in progress at its next step",
        "  reset-gate                           Force the model busy flag back to idle",
        "  status                               Show gate, turn, cycle, queue and watcher state",
        "  logs [n]                             Print the last n runtime log lines (default 20)",
        "  watch <kind>                         Run one watcher in the foreground",
        "  supervise                            Run every enabled watcher until `stop`",
        "  stop                                 Stop the running supervisor",
        "  job list|show|set|delete ...         Manage job definitions",
        "  sequence show|set <jobs...>          Show or replace the per-turn job sequence",
        "  queue list|add <job> [k=v ...]       Inspect or extend the job queue",
        "  cycle ...                            Manage cycles and the active cycle",
        "  schedule add|list|delete|prune ...   Manage one-shot schedule entries",
        "  archive on|off|status|close|new|shutdown",
        "                                       Control conversation archival",
        "  topics [list|pending|done <name>]    Inspect the topic index",
        "  tasks|goals [list|show|add|done|reopen|delete]",
        "                                       Inspect extracted tasks and goals",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_documented_command_parses_to_a_known_verb() {
        for line in cli_help_lines() {
            let Some(command) = line.strip_prefix("  ").filter(|rest| !rest.starts_with(' ')) else {
                continue;
            };
            let Some(word) = command.split_whitespace().next() else {
                continue;
            };
            for verb in word.split('|') {
                assert_ne!(parse_cli_verb(verb), CliVerb::Unknown, "{verb}");
            }
        }
    }
}
