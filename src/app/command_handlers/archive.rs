use crate::app::command_support::{open_context, GlobalOptions};
use crate::archive::{close_open_sessions, list_sessions, ArchiveControl, ArchiveManager};
use crate::runtime::{supervisor_ownership_state, OwnershipState, RuntimeContext};
use crate::watchers::WatcherKind;

const USAGE: &str = "usage: archive <on|off|status|close|new|shutdown>";

pub fn cmd_archive(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let [action] = args else {
        return Err(USAGE.to_string());
    };
    let ctx = open_context(options)?;
    let inbox = &ctx.inbox;

    match action.as_str() {
        "on" | "off" => {
            let enabled = action == "on";
            let previous = inbox.set_enabled(enabled).map_err(|e| e.to_string())?;
            Ok(format!("archive switched\nenabled={enabled}\nprevious={previous}"))
        }
        "status" => {
            let mut lines = vec![
                format!("enabled={}", inbox.enabled().map_err(|e| e.to_string())?),
                format!(
                    "pending={}",
                    inbox.pending().map_err(|e| e.to_string())?.len()
                ),
            ];
            for session in list_sessions(&ctx.paths.archive_dir()).map_err(|e| e.to_string())? {
                lines.push(format!(
                    "{}\topen={}\tblocks={}\tpairs={}",
                    session.meta.id,
                    session.meta.is_open(),
                    session.blocks,
                    session.pairs
                ));
            }
            Ok(lines.join("\n"))
        }
        "close" | "new" | "shutdown" => {
            let control = match action.as_str() {
                "close" => ArchiveControl::CloseSession,
                "new" => ArchiveControl::ForceNewSession,
                _ => ArchiveControl::Shutdown,
            };
            if verbatim_watcher_running(&ctx) {
                inbox.request(control).map_err(|e| e.to_string())?;
                return Ok(format!("archive request queued\nrequest={}", control.as_str()));
            }
            // Nobody is archiving; act on the directory directly.
            if control == ArchiveControl::ForceNewSession {
                let mut manager = ArchiveManager::resume(
                    &ctx.paths.archive_dir(),
                    ctx.settings.archive.block_capacity,
                )
                .map_err(|e| e.to_string())?;
                let id = manager.force_new_session().map_err(|e| e.to_string())?;
                return Ok(format!("archive session started\nsession={id}"));
            }
            let closed =
                close_open_sessions(&ctx.paths.archive_dir()).map_err(|e| e.to_string())?;
            Ok(format!(
                "archive sessions closed\nclosed={}",
                if closed.is_empty() {
                    "none".to_string()
                } else {
                    closed.join(",")
                }
            ))
        }
        other => Err(format!("unknown archive action `{other}`\n{USAGE}")),
    }
}

fn verbatim_watcher_running(ctx: &RuntimeContext) -> bool {
    let locks = ctx.store.locks();
    if locks.is_held(&WatcherKind::Verbatim.instance_lock()) {
        return true;
    }
    matches!(
        supervisor_ownership_state(&ctx.paths, locks),
        Ok(OwnershipState::Running { .. })
    ) && ctx.settings.watchers.verbatim.enabled
}
