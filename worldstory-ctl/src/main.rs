mod control_client;

use anyhow::Context;
use control_client::SyncClient;
use serde_json::{Value, json};
use worldstory_integrations::SyncHealth;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Status,
    List(Option<String>),
    Enqueue {
        operation_type: String,
        endpoint: String,
        payload: String,
    },
    Delete(i64),
    Retry(i64),
    RetryFailed,
    Sync,
    Clear,
    Log(u32),
    SetOnline(bool),
    AutoOnline,
    Help,
}

const DEFAULT_LOG_LIMIT: u32 = 20;

fn parse_command<I>(args: I) -> anyhow::Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let Some(flag) = args.next() else {
        return Ok(Command::Status);
    };
    let command = match flag.as_str() {
        "--status" => Command::Status,
        "--list" => Command::List(args.next()),
        "--enqueue" => {
            let operation_type = args
                .next()
                .context("--enqueue needs TYPE ENDPOINT JSON")?
                .to_ascii_uppercase();
            let endpoint = args.next().context("--enqueue needs ENDPOINT")?;
            let payload = args.next().context("--enqueue needs a JSON payload")?;
            Command::Enqueue {
                operation_type,
                endpoint,
                payload,
            }
        }
        "--delete" => Command::Delete(parse_id(args.next())?),
        "--retry" => Command::Retry(parse_id(args.next())?),
        "--retry-failed" => Command::RetryFailed,
        "--sync" => Command::Sync,
        "--clear" => Command::Clear,
        "--log" => Command::Log(match args.next() {
            Some(limit) => limit
                .parse()
                .with_context(|| format!("invalid log limit: {limit}"))?,
            None => DEFAULT_LOG_LIMIT,
        }),
        "--online" => Command::SetOnline(true),
        "--offline" => Command::SetOnline(false),
        "--auto" => Command::AutoOnline,
        "--help" | "-h" => Command::Help,
        other => anyhow::bail!("unknown argument: {other}"),
    };
    if let Some(extra) = args.next() {
        anyhow::bail!("unexpected argument: {extra}");
    }
    Ok(command)
}

fn parse_id(value: Option<String>) -> anyhow::Result<i64> {
    let value = value.context("missing operation id")?;
    value
        .parse()
        .with_context(|| format!("invalid operation id: {value}"))
}

fn print_help() {
    println!("Usage: worldstory-ctl [COMMAND]");
    println!("  --status                       Show queue and connectivity status (default)");
    println!("  --list [STATUS]                List queued operations, optionally by status");
    println!("  --enqueue TYPE ENDPOINT JSON   Queue a CREATE, UPDATE or DELETE operation");
    println!("  --delete ID                    Remove an operation from the queue");
    println!("  --retry ID                     Requeue one operation and sync");
    println!("  --retry-failed                 Requeue every failed operation and sync");
    println!("  --sync                         Start a sync pass now");
    println!("  --clear                        Delete all queued operations, log and drafts");
    println!("  --log [LIMIT]                  Show recent sync log entries");
    println!("  --online | --offline           Pin connectivity state; probing is ignored");
    println!("  --auto                         Let the connectivity probe decide again");
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let command = parse_command(std::env::args())?;
    if command == Command::Help {
        print_help();
        return Ok(());
    }

    let client = SyncClient::connect()?;
    match command {
        Command::Status => {
            let status = client.status()?;
            if let Some(health) = status
                .get("health")
                .cloned()
                .and_then(|value| serde_json::from_value::<SyncHealth>(value).ok())
            {
                eprintln!("{}", health.label());
            }
            print_json(&status)?;
        }
        Command::List(status) => print_json(&client.list_operations(status.as_deref())?)?,
        Command::Enqueue {
            operation_type,
            endpoint,
            payload,
        } => {
            let id = client.enqueue(&operation_type, &endpoint, &payload)?;
            print_json(&json!({ "id": id }))?;
        }
        Command::Delete(id) => {
            client.delete_operation(id)?;
            print_json(&json!({ "deleted": id }))?;
        }
        Command::Retry(id) => {
            client.retry_operation(id)?;
            print_json(&json!({ "requeued": id }))?;
        }
        Command::RetryFailed => {
            let requeued = client.retry_failed()?;
            print_json(&json!({ "requeued": requeued }))?;
        }
        Command::Sync => {
            let started = client.sync_now()?;
            print_json(&json!({ "started": started }))?;
        }
        Command::Clear => {
            client.clear_all()?;
            print_json(&json!({ "cleared": true }))?;
        }
        Command::Log(limit) => print_json(&client.sync_log(limit)?)?,
        Command::SetOnline(online) => {
            client.set_online(online)?;
            print_json(&json!({ "online": online, "pinned": true }))?;
        }
        Command::AutoOnline => {
            client.clear_online_override()?;
            print_json(&json!({ "pinned": false }))?;
        }
        Command::Help => {}
    }
    Ok(())
}
