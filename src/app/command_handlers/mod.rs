use crate::app::cli::{help_text, parse_cli_verb, CliVerb};
use crate::app::command_support::split_global_options;
use crate::watchers::WorkItemKind;

pub mod archive;
pub mod cycles;
pub mod daemon;
pub mod items;
pub mod jobs;
pub mod schedule;
pub mod turns;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let (options, args) = split_global_options(&args)?;
    let Some(verb) = args.first() else {
        return Ok(help_text());
    };
    let rest = &args[1..];

    match parse_cli_verb(verb) {
        CliVerb::Init => turns::cmd_init(&options),
        CliVerb::Submit => turns::cmd_submit(&options, rest),
        CliVerb::RunTrigger => turns::cmd_run_trigger(&options, rest),
        CliVerb::Cancel => turns::cmd_cancel(&options),
        CliVerb::ResetGate => turns::cmd_reset_gate(&options),
        CliVerb::Status => daemon::cmd_status(&options),
        CliVerb::Logs => daemon::cmd_logs(&options, rest),
        CliVerb::Watch => daemon::cmd_watch(&options, rest),
        CliVerb::Supervise => daemon::cmd_supervise(&options),
        CliVerb::Stop => daemon::cmd_stop(&options),
        CliVerb::Job => jobs::cmd_job(&options, rest),
        CliVerb::Sequence => jobs::cmd_sequence(&options, rest),
        CliVerb::Queue => jobs::cmd_queue(&options, rest),
        CliVerb::Cycle => cycles::cmd_cycle(&options, rest),
        CliVerb::Schedule => schedule::cmd_schedule(&options, rest),
        CliVerb::Archive => archive::cmd_archive(&options, rest),
        CliVerb::Topics => items::cmd_topics(&options, rest),
        CliVerb::Tasks => items::cmd_work_items(&options, WorkItemKind::Task, rest),
        CliVerb::Goals => items::cmd_work_items(&options, WorkItemKind::Goal, rest),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{verb}`\n\n{}", help_text())),
    }
}
