use crate::app::command_support::{open_context, GlobalOptions};
use crate::watchers::{WorkItem, WorkItemKind, WorkItemStatus};

pub fn cmd_topics(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let ctx = open_context(options)?;
    let topics = ctx.topics();
    match args {
        [] => cmd_topics(options, &["list".to_string()]),
        [action] if action == "list" => {
            let names = topics.indexed().map_err(|e| e.to_string())?;
            let mut lines = vec![format!("indexed={}", names.len())];
            lines.extend(names.into_iter().map(|name| format!("topic={name}")));
            Ok(lines.join("\n"))
        }
        [action] if action == "pending" => {
            let pending = topics.pending().map_err(|e| e.to_string())?;
            let mut lines = vec![format!("pending={}", pending.len())];
            lines.extend(
                pending
                    .into_iter()
                    .map(|topic| format!("topic={} queued_at_ms={}", topic.name, topic.queued_at_ms)),
            );
            Ok(lines.join("\n"))
        }
        [action, name @ ..] if action == "done" && !name.is_empty() => {
            let name = name.join(" ");
            let added = topics.mark_indexed(&name).map_err(|e| e.to_string())?;
            Ok(format!("topic indexed\ntopic={name}\nnew={added}"))
        }
        _ => Err("usage: topics <list|pending|done <name>>".to_string()),
    }
}

pub fn cmd_work_items(
    options: &GlobalOptions,
    kind: WorkItemKind,
    args: &[String],
) -> Result<String, String> {
    let ctx = open_context(options)?;
    let book = ctx.work_items();
    let noun = kind.as_str();
    let usage = || {
        format!(
            "usage: {} <list|show <id>|add <title> [body]|done <id>|reopen <id>|delete <id>>",
            kind.dir()
        )
    };

    match args {
        [] => cmd_work_items(options, kind, &["list".to_string()]),
        [action] if action == "list" => {
            let items = book.list(kind).map_err(|e| e.to_string())?;
            let mut lines = vec![format!("{}={}", kind.dir(), items.len())];
            lines.extend(items.iter().map(summary_line));
            Ok(lines.join("\n"))
        }
        [action, id] if action == "show" => {
            let item = book
                .get(kind, id)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("unknown {noun} `{id}`"))?;
            let mut lines = vec![
                format!("id={}", item.id),
                format!("status={}", item.status.as_str()),
                format!("title={}", item.title),
                format!("created_at={}", item.created_at.to_rfc3339()),
                format!("updated_at={}", item.updated_at.to_rfc3339()),
            ];
            if !item.body.is_empty() {
                lines.push(item.body.clone());
            }
            Ok(lines.join("\n"))
        }
        [action, title, body @ ..] if action == "add" => {
            let item = book
                .create(kind, title, &body.join(" "), None)
                .map_err(|e| e.to_string())?;
            Ok(format!("{noun} created\nid={}", item.id))
        }
        [action, id] if action == "done" || action == "reopen" => {
            let status = if action == "done" {
                WorkItemStatus::Done
            } else {
                WorkItemStatus::Open
            };
            let item = book
                .set_status(kind, id, status)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("unknown {noun} `{id}`"))?;
            Ok(format!(
                "{noun} updated\nid={}\nstatus={}",
                item.id,
                item.status.as_str()
            ))
        }
        [action, id, status] if action == "status" => {
            let status = WorkItemStatus::parse(status)?;
            cmd_work_items(
                options,
                kind,
                &[
                    match status {
                        WorkItemStatus::Done => "done",
                        WorkItemStatus::Open => "reopen",
                    }
                    .to_string(),
                    id.clone(),
                ],
            )
        }
        [action, id] if action == "delete" => {
            if !book.delete(kind, id).map_err(|e| e.to_string())? {
                return Err(format!("unknown {noun} `{id}`"));
            }
            Ok(format!("{noun} deleted\nid={id}"))
        }
        _ => Err(usage()),
    }
}

fn summary_line(item: &WorkItem) -> String {
    format!("{} [{}] {}", item.id, item.status.as_str(), item.title)
}
