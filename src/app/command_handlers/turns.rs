use crate::app::command_support::{open_context, or_none, GlobalOptions};
use crate::config::save_settings;
use crate::sequencer::{request_cancel, spawn_turn};

pub fn cmd_init(options: &GlobalOptions) -> Result<String, String> {
    let ctx = open_context(options)?;
    let settings_file = ctx.paths.settings_file();
    let wrote_settings = !settings_file.exists();
    if wrote_settings {
        save_settings(&ctx.settings, &settings_file).map_err(|e| e.to_string())?;
    }
    let jobs = ctx.jobs().load_all().map_err(|e| e.to_string())?;
    let sequence = ctx.jobs().load_sequence().map_err(|e| e.to_string())?;
    Ok(format!(
        "initialized\nstate_root={}\nsettings_written={wrote_settings}\njobs={}\nsequence={}",
        ctx.paths.root.display(),
        jobs.len(),
        sequence.join(",")
    ))
}

/// Runs the turn on a background thread and waits for it; a `cancel` from
/// another process stops it at the next job boundary.
pub fn cmd_submit(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let text = args.join(" ");
    if text.trim().is_empty() {
        return Err("usage: submit <text>".to_string());
    }
    let ctx = open_context(options)?;
    let outcome = spawn_turn(&ctx.sequencer, text)
        .wait()
        .map_err(|e| e.to_string())?;
    let status = if outcome.is_complete() {
        "complete"
    } else if outcome.is_cancelled() {
        "cancelled"
    } else {
        "incomplete"
    };
    Ok(format!(
        "status={status}\njobs_run={}\n\n{}",
        outcome.outputs.len(),
        outcome.display_text()
    ))
}

pub fn cmd_run_trigger(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let [name] = args else {
        return Err("usage: run-trigger <job>".to_string());
    };
    let ctx = open_context(options)?;
    ctx.sequencer.run_trigger(name).map_err(|e| e.to_string())
}

pub fn cmd_cancel(options: &GlobalOptions) -> Result<String, String> {
    let ctx = open_context(options)?;
    request_cancel(&ctx.store).map_err(|e| e.to_string())?;
    Ok("cancel requested".to_string())
}

pub fn cmd_reset_gate(options: &GlobalOptions) -> Result<String, String> {
    let ctx = open_context(options)?;
    let previous = ctx.gate().force_idle().map_err(|e| e.to_string())?;
    Ok(format!(
        "gate reset\nprevious_state={}\nprevious_owner={}",
        if previous.is_idle() { "idle" } else { "busy" },
        or_none(previous.owner)
    ))
}
