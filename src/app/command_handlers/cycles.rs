use crate::app::command_support::{open_context, parse_bool, parse_name_list, GlobalOptions};
use crate::cycles::{ActiveCycle, CycleDefinition};
use crate::shared::ids::{CycleName, TriggerName};

const USAGE: &str = "usage: cycle <list|show <name>|create <name> [--kind <kind>] [--description <text>]|delete <name>|describe <name> <text>|loop <name> <true|false>|add-trigger <cycle> <trigger> <prompt>|delete-trigger <cycle> <trigger>|reorder <cycle> <triggers...>|start <name>|stop|resume|status>";

pub fn cmd_cycle(options: &GlobalOptions, args: &[String]) -> Result<String, String> {
    let Some(action) = args.first() else {
        return Err(USAGE.to_string());
    };
    let ctx = open_context(options)?;
    let editor = ctx.cycles.editor();
    let map = |e: crate::cycles::CycleError| e.to_string();

    match (action.as_str(), &args[1..]) {
        ("list", []) => {
            let cycles = ctx.cycles.list().map_err(map)?;
            if cycles.is_empty() {
                return Ok("no cycles".to_string());
            }
            Ok(cycles
                .iter()
                .map(|cycle| {
                    format!(
                        "{}\tkind={}\ttriggers={}\tloop={}",
                        cycle.name,
                        cycle.kind,
                        cycle.triggers.len(),
                        cycle.repeat
                    )
                })
                .collect::<Vec<_>>()
                .join("\n"))
        }
        ("show", [name]) => {
            let cycle = ctx
                .cycles
                .get(name)
                .map_err(map)?
                .ok_or_else(|| format!("cycle `{name}` does not exist"))?;
            Ok(render_cycle(&cycle))
        }
        ("create", [name, flags @ ..]) => {
            let name = CycleName::parse(name)?;
            let mut kind = String::new();
            let mut description = String::new();
            let mut flags = flags.iter();
            while let Some(flag) = flags.next() {
                let value = flags
                    .next()
                    .ok_or_else(|| format!("missing value for {flag}"))?;
                match flag.as_str() {
                    "--kind" => kind = value.clone(),
                    "--description" => description = value.clone(),
                    other => return Err(format!("unknown option `{other}`\n{USAGE}")),
                }
            }
            editor.create(&name, &kind, &description).map_err(map)?;
            Ok(format!("cycle created\nname={name}"))
        }
        ("delete", [name]) => {
            editor.delete(name).map_err(map)?;
            Ok(format!("cycle deleted\nname={name}"))
        }
        ("describe", [name, text @ ..]) if !text.is_empty() => {
            editor.set_description(name, &text.join(" ")).map_err(map)?;
            Ok(format!("cycle updated\nname={name}"))
        }
        ("loop", [name, value]) => {
            let repeat = parse_bool(value, "loop")?;
            editor.set_loop(name, repeat).map_err(map)?;
            Ok(format!("cycle updated\nname={name}\nloop={repeat}"))
        }
        ("add-trigger", [cycle, trigger, prompt @ ..]) if !prompt.is_empty() => {
            let trigger = TriggerName::parse(trigger)?;
            editor
                .add_trigger(cycle, &trigger, &prompt.join(" "))
                .map_err(map)?;
            Ok(format!("trigger saved\ncycle={cycle}\ntrigger={trigger}"))
        }
        ("delete-trigger", [cycle, trigger]) => {
            editor.delete_trigger(cycle, trigger).map_err(map)?;
            Ok(format!("trigger deleted\ncycle={cycle}\ntrigger={trigger}"))
        }
        ("reorder", [cycle, order @ ..]) if !order.is_empty() => {
            let order = parse_name_list(order);
            editor.reorder_triggers(cycle, &order).map_err(map)?;
            Ok(format!("triggers reordered\ncycle={cycle}\norder={}", order.join(",")))
        }
        ("start", [name]) => render_active("cycle started", &editor.activate(name).map_err(map)?),
        ("stop", []) => render_active("cycle stopped", &editor.stop().map_err(map)?),
        ("resume", []) => render_active("cycle resumed", &editor.resume().map_err(map)?),
        ("status", []) => match ctx.cycles.active().map_err(map)? {
            Some(active) => render_active("active cycle", &active),
            None => Ok("no active cycle".to_string()),
        },
        _ => Err(USAGE.to_string()),
    }
}

fn render_cycle(cycle: &CycleDefinition) -> String {
    let mut lines = vec![
        format!("name={}", cycle.name),
        format!("kind={}", cycle.kind),
        format!("loop={}", cycle.repeat),
        format!("description={}", cycle.description),
    ];
    for (index, trigger) in cycle.triggers.iter().enumerate() {
        lines.push(format!("trigger[{index}]={}: {}", trigger.name, trigger.prompt));
    }
    lines.join("\n")
}

fn render_active(header: &str, active: &ActiveCycle) -> Result<String, String> {
    let mut out = format!(
        "{header}\nname={}\nstatus={}\nstep={}\nrounds={}",
        active.name,
        active.status.as_str(),
        active.current_step,
        active.rounds
    );
    if let Some(error) = &active.last_error {
        out.push_str(&format!("\nlast_error={error}"));
    }
    Ok(out)
}
