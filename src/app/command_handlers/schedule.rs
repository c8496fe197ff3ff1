use crate::app::command_support::{open_context, GlobalOptions};
use crate::shared::time::parse_due_at;
use chrono::{Duration, Utc};

const USAGE: &str =
    "usage: schedule <add <job> <due_at|+30m>|list|delete <id>|prune [keep_hours]>";
const DEFAULT_KEEP_HOURS: i64 = 24;

pub fn cmd_schedule(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let Some(action) = args.first() else {
        return Err(USAGE.to_string());
    };
    let ctx = open_context(options)?;
    let book = &ctx.schedules;

    match (action.as_str(), &args[1..]) {
        ("add", [job, due]) => {
            if ctx.jobs().get(job).map_err(|e| e.to_string())?.is_none() {
                return Err(format!("job `{job}` is not defined"));
            }
            let due_at = parse_due_at(due)?;
            let entry = book.add(job, due_at).map_err(|e| e.to_string())?;
            Ok(format!(
                "schedule created\nid={}\njob={}\ndue_at={}",
                entry.id,
                entry.job_name,
                entry.due_at.to_rfc3339()
            ))
        }
        ("list", []) => {
            let entries = book.list().map_err(|e| e.to_string())?;
            if entries.is_empty() {
                return Ok("no schedules".to_string());
            }
            Ok(entries
                .iter()
                .map(|entry| {
                    format!(
                        "{}\tjob={}\tdue_at={}\tfired_at={}",
                        entry.id,
                        entry.job_name,
                        entry.due_at.to_rfc3339(),
                        entry
                            .fired_at
                            .map(|at| at.to_rfc3339())
                            .unwrap_or_else(|| "none".to_string())
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ("delete", [id]) => {
            let removed = book.delete(id).map_err(|e| e.to_string())?;
            if !removed {
                return Err(format!("schedule `{id}` not found"));
            }
            Ok(format!("schedule deleted\nid={id}"))
        }
        ("prune", rest) if rest.len() <= 1 => {
            let hours = match rest.first() {
                Some(raw) => raw
                    .parse::<i64>()
                    .map_err(|_| format!("invalid keep_hours `{raw}`"))?,
                None => DEFAULT_KEEP_HOURS,
            };
            let removed = book
                .prune_fired(Utc::now(), Duration::hours(hours))
                .map_err(|e| e.to_string())?;
            Ok(format!("schedule pruned\nremoved={removed}"))
        }
        _ => Err(USAGE.to_string()),
    }
}
