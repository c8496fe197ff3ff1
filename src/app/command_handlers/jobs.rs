use crate::app::command_support::{open_context, parse_key_values, parse_name_list, GlobalOptions};
use crate::jobs::{JobDefinition, QueuedJob};
use crate::shared::ids::JobName;

pub fn cmd_job(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let usage = "usage: job <list|show <name>|set <name> <instructions> [--trigger <text>] [--output <record>]|delete <name>>";
    let Some(action) = args.first() else {
        return Err(usage.to_string());
    };
    let ctx = open_context(options)?;
    let catalog = ctx.jobs();

    match action.as_str() {
        "list" => {
            let jobs = catalog.load_all().map_err(|e| e.to_string())?;
            if jobs.is_empty() {
                return Ok("no jobs".to_string());
            }
            Ok(jobs
                .iter()
                .map(|(name, def)| format!("{name}\ttrigger={}", def.trigger_text(name)))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        "show" => {
            let [_, name] = args else {
                return Err(usage.to_string());
            };
            let def = catalog
                .get(name)
                .map_err(|e| e.to_string())?
                .ok_or_else(|| format!("job `{name}` is not defined"))?;
            Ok(format!(
                "name={name}\ntrigger={}\noutput={}\ninstructions:\n{}",
                def.trigger_text(name),
                def.output.as_deref().unwrap_or("none"),
                def.instructions
            ))
        }
        "set" => {
            if args.len() < 3 {
                return Err(usage.to_string());
            }
            let name = JobName::parse(&args[1])?;
            let mut definition = JobDefinition {
                instructions: args[2].clone(),
                ..JobDefinition::default()
            };
            let mut flags = args[3..].iter();
            while let Some(flag) = flags.next() {
                let value = flags
                    .next()
                    .ok_or_else(|| format!("missing value for {flag}"))?;
                match flag.as_str() {
                    "--trigger" => definition.trigger = value.clone(),
                    "--output" => definition.output = Some(value.clone()),
                    other => return Err(format!("unknown option `{other}`\n{usage}")),
                }
            }
            catalog.save(&name, definition).map_err(|e| e.to_string())?;
            Ok(format!("job saved\nname={name}"))
        }
        "delete" => {
            let [_, name] = args else {
                return Err(usage.to_string());
            };
            let removed = catalog.delete(name).map_err(|e| e.to_string())?;
            Ok(format!("job deleted\nname={name}\nremoved={removed}"))
        }
        other => Err(format!("unknown job action `{other}`\n{usage}")),
    }
}

pub fn cmd_sequence(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let ctx = open_context(options)?;
    match args.first().map(String::as_str) {
        None | Some("show") => {
            let sequence = ctx.jobs().load_sequence().map_err(|e| e.to_string())?;
            Ok(format!("sequence={}", sequence.join(",")))
        }
        Some("set") => {
            let jobs = parse_name_list(&args[1..]);
            ctx.jobs().save_sequence(&jobs).map_err(|e| e.to_string())?;
            Ok(format!("sequence saved\nsequence={}", jobs.join(",")))
        }
        Some(other) => Err(format!(
            "unknown sequence action `{other}`\nusage: sequence <show|set <jobs...>>"
        )),
    }
}

pub fn cmd_queue(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let ctx = open_context(options)?;
    match args.first().map(String::as_str) {
        None | Some("list") => {
            let pending = ctx.queue.pending().map_err(|e| e.to_string())?;
            if pending.is_empty() {
                return Ok("queue empty".to_string());
            }
            Ok(pending
                .iter()
                .map(|job| format!("{}\tsource={}\targs={}", job.name, job.source, job.args.len()))
                .collect::<Vec<_>>()
                .join("\n"))
        }
        Some("add") => {
            let name = args
                .get(1)
                .ok_or_else(|| "usage: queue add <job> [key=value ...]".to_string())?;
            if ctx.jobs().get(name).map_err(|e| e.to_string())?.is_none() {
                return Err(format!("job `{name}` is not defined"));
            }
            let mut job = QueuedJob::new(name, "cli");
            job.args = parse_key_values(&args[2..])?;
            let depth = ctx.queue.push(job).map_err(|e| e.to_string())?;
            Ok(format!("job queued\nname={name}\nqueue_depth={depth}"))
        }
        Some(other) => Err(format!(
            "unknown queue action `{other}`\nusage: queue <list|add <job> [key=value ...]>"
        )),
    }
}
