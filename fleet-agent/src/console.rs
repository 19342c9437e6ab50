//! Line-oriented operator console on stdin.
//!
//! ```text
//! pair <number>        print a pairing code
//! connect <number>
//! disconnect <number>
//! delete <number>
//! block <number>
//! unblock <number>
//! status [<number>]
//! blocked
//! ```
//!
//! Each line becomes one [`AgentCmd`]; the reply is printed on stdout.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

// ---

use fleet_domain::TenantKey;

// ---

use super::AgentCmd;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    // ---
    Pair(TenantKey),
    Connect(TenantKey),
    Disconnect(TenantKey),
    Delete(TenantKey),
    Block(TenantKey),
    Unblock(TenantKey),
    Status(Option<TenantKey>),
    Blocked,
    Help,
}

// ---

const HELP: &str = "commands: pair|connect|disconnect|delete|block|unblock <number>, \
                    status [<number>], blocked, help";

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<Command>, String> {
    // ---
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();

    // Numbers may be typed with spaces ("+1 555 0100").
    let tenant = || -> Result<TenantKey, String> {
        if rest.is_empty() {
            return Err(format!("{verb}: missing tenant number"));
        }
        TenantKey::parse(&rest.concat()).map_err(|e| e.to_string())
    };

    let cmd = match verb.to_ascii_lowercase().as_str() {
        "pair" => Command::Pair(tenant()?),
        "connect" => Command::Connect(tenant()?),
        "disconnect" => Command::Disconnect(tenant()?),
        "delete" => Command::Delete(tenant()?),
        "block" => Command::Block(tenant()?),
        "unblock" => Command::Unblock(tenant()?),
        "status" if rest.is_empty() => Command::Status(None),
        "status" => Command::Status(Some(tenant()?)),
        "blocked" => Command::Blocked,
        "help" | "?" => Command::Help,
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(Some(cmd))
}

// ---------------------------------------------------------------------------
// execute
// ---------------------------------------------------------------------------

/// Send `cmd` to the agent and render its reply as one or more lines.
pub async fn execute(cmd_tx: &mpsc::Sender<AgentCmd>, cmd: Command) -> String {
    // ---
    match cmd {
        Command::Help => HELP.to_string(),

        Command::Pair(tenant) => {
            let (reply, rx) = oneshot::channel();
            let cmd = AgentCmd::Pair {
                tenant: tenant.clone(),
                reply,
            };
            match request(cmd_tx, cmd, rx).await {
                Ok(Ok(code)) => format!("{tenant}: pairing code {code}"),
                Ok(Err(e)) => format!("{tenant}: {e}"),
                Err(msg) => msg,
            }
        }

        Command::Connect(tenant) => {
            unit(cmd_tx, tenant, "connected", |tenant, reply| AgentCmd::Connect {
                tenant,
                reply,
            })
            .await
        }
        Command::Disconnect(tenant) => {
            unit(cmd_tx, tenant, "disconnected", |tenant, reply| AgentCmd::Disconnect {
                tenant,
                reply,
            })
            .await
        }
        Command::Delete(tenant) => {
            unit(cmd_tx, tenant, "deleted", |tenant, reply| AgentCmd::Delete {
                tenant,
                reply,
            })
            .await
        }
        Command::Block(tenant) => {
            unit(cmd_tx, tenant, "blocked", |tenant, reply| AgentCmd::Block {
                tenant,
                reply,
            })
            .await
        }
        Command::Unblock(tenant) => {
            unit(cmd_tx, tenant, "unblocked", |tenant, reply| AgentCmd::Unblock {
                tenant,
                reply,
            })
            .await
        }

        Command::Status(tenant) => {
            let (reply, rx) = oneshot::channel();
            match request(cmd_tx, AgentCmd::Status { tenant, reply }, rx).await {
                Ok(statuses) if statuses.is_empty() => "no tracked tenants".to_string(),
                Ok(statuses) => statuses
                    .into_iter()
                    .map(|(tenant, status)| {
                        let doc =
                            serde_json::json!({ "tenant": tenant.as_str(), "status": status });
                        doc.to_string()
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Err(msg) => msg,
            }
        }

        Command::Blocked => {
            let (reply, rx) = oneshot::channel();
            match request(cmd_tx, AgentCmd::ListBlocked { reply }, rx).await {
                Ok(Ok(entries)) if entries.is_empty() => "no blocked tenants".to_string(),
                Ok(Ok(entries)) => entries
                    .into_iter()
                    .map(|e| format!("{} blocked at {}", e.tenant, e.blocked_at.to_rfc3339()))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Ok(Err(e)) => format!("error: {e}"),
                Err(msg) => msg,
            }
        }
    }
}

// ---

async fn request<T>(
    cmd_tx: &mpsc::Sender<AgentCmd>,
    cmd: AgentCmd,
    rx: oneshot::Receiver<T>,
) -> Result<T, String> {
    // ---
    cmd_tx
        .send(cmd)
        .await
        .map_err(|_| "agent loop has shut down".to_string())?;
    rx.await.map_err(|_| "agent dropped the request".to_string())
}

async fn unit<F>(cmd_tx: &mpsc::Sender<AgentCmd>, tenant: TenantKey, done: &str, build: F) -> String
where
    F: FnOnce(TenantKey, oneshot::Sender<fleet_domain::Result<()>>) -> AgentCmd,
{
    // ---
    let (reply, rx) = oneshot::channel();
    match request(cmd_tx, build(tenant.clone(), reply), rx).await {
        Ok(Ok(())) => format!("{tenant}: {done}"),
        Ok(Err(e)) => format!("{tenant}: {e}"),
        Err(msg) => msg,
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Read commands from stdin until EOF.
pub async fn run(cmd_tx: mpsc::Sender<AgentCmd>) {
    // ---
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match parse_line(&line) {
                Ok(Some(cmd)) => println!("{}", execute(&cmd_tx, cmd).await),
                Ok(None) => {}
                Err(msg) => println!("error: {msg}"),
            },
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("console read failed: {e}");
                break;
            }
        }
    }

    tracing::debug!("console closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
