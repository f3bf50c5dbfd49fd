//! `canaryctl` — CLI wrapper over the canaryd HTTP API.
//!
//! Connection settings resolve in order: command-line flags, the config
//! file (`~/.canaryctl.toml`), then defaults (localhost:8080, no auth).
//! `canaryctl configure` persists the current flags to the config file.
//! Every other subcommand maps onto one API endpoint and prints the JSON
//! response; the exit code is 0 on success and 1 otherwise.

use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use canaryd::server::URL_PREFIX;

const CONFIG_FILE: &str = ".canaryctl.toml";

#[derive(Parser)]
#[command(name = "canaryctl", about = "CLI wrapper for the canaryd HTTP API", version)]
struct Cli {
    #[command(flatten)]
    connect: ConnectArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct ConnectArgs {
    /// Server host name.
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port.
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Authentication key.
    #[arg(long, global = true, conflicts_with = "no_auth_key")]
    auth_key: Option<String>,

    /// Disable authentication.
    #[arg(long, global = true)]
    no_auth_key: bool,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct Target {
    /// Canary name.
    #[arg(long)]
    name: Option<String>,

    /// Canary slug.
    #[arg(long)]
    slug: Option<String>,

    /// Canary identifier.
    #[arg(long)]
    id: Option<String>,
}

impl Target {
    fn push_onto(&self, params: &mut Vec<(String, String)>) {
        if let Some(name) = &self.name {
            params.push(("name".into(), name.clone()));
        }
        if let Some(slug) = &self.slug {
            params.push(("slug".into(), slug.clone()));
        }
        if let Some(id) = &self.id {
            params.push(("id".into(), id.clone()));
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Save connection settings to the config file.
    Configure,

    /// Create a canary.
    Create {
        #[arg(long)]
        name: String,
        /// Seconds, or a semicolon-delimited crontab schedule.
        #[arg(long)]
        periodicity: String,
        #[arg(long)]
        description: Option<String>,
        /// Notification address; repeatable.
        #[arg(long = "email")]
        emails: Vec<String>,
        #[arg(long)]
        paused: bool,
    },

    /// Delete a canary.
    Delete {
        #[command(flatten)]
        target: Target,
    },

    /// Update a canary. With only --name given, the name is used to look
    /// the canary up rather than to rename it.
    Update {
        #[arg(long)]
        name: Option<String>,
        #[arg(long, conflicts_with = "id")]
        slug: Option<String>,
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        periodicity: Option<String>,
        #[arg(long)]
        description: Option<String>,
        /// Specify "-" to clear existing email(s).
        #[arg(long = "email")]
        emails: Vec<String>,
    },

    /// Get a canary.
    Get {
        #[command(flatten)]
        target: Target,
    },

    /// List canaries.
    List {
        #[arg(long)]
        verbose: bool,
        #[arg(long, conflicts_with = "no_paused")]
        paused: bool,
        #[arg(long)]
        no_paused: bool,
        #[arg(long, conflicts_with = "no_late")]
        late: bool,
        #[arg(long)]
        no_late: bool,
        /// Regular expression matched against name, slug, identifier, and
        /// notification addresses.
        #[arg(long)]
        search: Option<String>,
    },

    /// Trigger a canary.
    Trigger {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Pause a canary.
    Pause {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        comment: Option<String>,
    },

    /// Unpause a canary.
    Unpause {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        comment: Option<String>,
    },
}

/// Persistent connection settings.
#[derive(Debug, Default, Serialize, Deserialize)]
struct FileConfig {
    host: Option<String>,
    port: Option<u16>,
    auth_key: Option<String>,
}

struct Connection {
    host: String,
    port: u16,
    auth_key: Option<String>,
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), String> {
    let file = load_file_config();
    let conn = Connection {
        host: cli.connect.host.or(file.host).unwrap_or_else(|| "localhost".into()),
        port: cli.connect.port.or(file.port).unwrap_or(8080),
        auth_key: if cli.connect.no_auth_key {
            None
        } else {
            cli.connect.auth_key.or(file.auth_key)
        },
    };

    match cli.command {
        Command::Configure => configure(&conn),
        Command::Create { name, periodicity, description, emails, paused } => {
            let mut params = vec![
                ("name".to_string(), name),
                ("periodicity".to_string(), periodicity),
            ];
            if let Some(description) = description {
                params.push(("description".into(), description));
            }
            for email in emails {
                params.push(("email".into(), email));
            }
            if paused {
                params.push(("paused".into(), "true".into()));
            }
            call(&conn, "create", params, true).map(|_| ())
        }
        Command::Delete { target } => {
            let mut params = Vec::new();
            target.push_onto(&mut params);
            call(&conn, "delete", params, true).map(|_| ())
        }
        Command::Update { name, slug, id, periodicity, description, emails } => {
            let mut params = Vec::new();
            let mut rename = name;
            if id.is_none() && slug.is_none() {
                // Only a name given: resolve it to an id instead of
                // treating it as a rename.
                let Some(lookup) = rename.take() else {
                    return Err("must specify --name, --id, or --slug".into());
                };
                let found = call(&conn, "get", vec![("name".into(), lookup)], false)?;
                let found_id = found
                    .pointer("/canary/id")
                    .and_then(|v| v.as_str())
                    .ok_or("malformed response: no canary id")?;
                params.push(("id".into(), found_id.to_string()));
            } else {
                if let Some(id) = id {
                    params.push(("id".into(), id));
                }
                if let Some(slug) = slug {
                    params.push(("slug".into(), slug));
                }
                if let Some(rename) = rename {
                    params.push(("name".into(), rename));
                }
            }
            if let Some(periodicity) = periodicity {
                params.push(("periodicity".into(), periodicity));
            }
            if let Some(description) = description {
                params.push(("description".into(), description));
            }
            for email in emails {
                params.push(("email".into(), email));
            }
            call(&conn, "update", params, true).map(|_| ())
        }
        Command::Get { target } => {
            let mut params = Vec::new();
            target.push_onto(&mut params);
            call(&conn, "get", params, true).map(|_| ())
        }
        Command::List { verbose, paused, no_paused, late, no_late, search } => {
            let mut params = Vec::new();
            if verbose {
                params.push(("verbose".into(), "true".into()));
            }
            if paused || no_paused {
                params.push(("paused".into(), paused.to_string()));
            }
            if late || no_late {
                params.push(("late".into(), late.to_string()));
            }
            if let Some(search) = search {
                params.push(("search".into(), search));
            }
            call(&conn, "list", params, true).map(|_| ())
        }
        Command::Trigger { target, comment } => {
            let mut params = Vec::new();
            target.push_onto(&mut params);
            if let Some(comment) = comment {
                params.push(("comment".into(), comment));
            }
            // The trigger endpoint never takes an auth key.
            let conn = Connection { auth_key: None, ..conn };
            call(&conn, "trigger", params, true).map(|_| ())
        }
        Command::Pause { target, comment } => {
            let mut params = Vec::new();
            target.push_onto(&mut params);
            if let Some(comment) = comment {
                params.push(("comment".into(), comment));
            }
            call(&conn, "pause", params, true).map(|_| ())
        }
        Command::Unpause { target, comment } => {
            let mut params = Vec::new();
            target.push_onto(&mut params);
            if let Some(comment) = comment {
                params.push(("comment".into(), comment));
            }
            call(&conn, "unpause", params, true).map(|_| ())
        }
    }
}

/// Issue one API request. Prints the response when `print` is set; always
/// returns the parsed JSON so callers can chain lookups.
fn call(
    conn: &Connection,
    command: &str,
    mut params: Vec<(String, String)>,
    print: bool,
) -> Result<serde_json::Value, String> {
    if let Some(auth_key) = &conn.auth_key {
        params.push(("auth_key".into(), auth_key.clone()));
    }

    let url = format!("http://{}:{}{}/{}", conn.host, conn.port, URL_PREFIX, command);
    let response = reqwest::blocking::Client::new()
        .get(&url)
        .query(&params)
        .send()
        .map_err(|e| format!("cannot reach {}:{}: {e}", conn.host, conn.port))?;

    let status = response.status();
    let text = response.text().map_err(|e| format!("cannot read response: {e}"))?;
    let body: serde_json::Value =
        serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

    if !status.is_success() {
        return Err(format!(
            "{status}\n{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        ));
    }
    if print {
        match serde_json::to_string_pretty(&body) {
            Ok(pretty) => println!("{pretty}"),
            Err(_) => println!("{body}"),
        }
    }
    Ok(body)
}

fn configure(conn: &Connection) -> Result<(), String> {
    let path = config_path();
    let config = FileConfig {
        host: Some(conn.host.clone()),
        port: Some(conn.port),
        auth_key: conn.auth_key.clone(),
    };
    let text = toml::to_string_pretty(&config).map_err(|e| format!("serialize config: {e}"))?;
    std::fs::write(&path, text).map_err(|e| format!("cannot write {}: {e}", path.display()))?;
    println!("saved {}", path.display());
    Ok(())
}

fn config_path() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(CONFIG_FILE)
}

fn load_file_config() -> FileConfig {
    let path = config_path();
    let Ok(text) = std::fs::read_to_string(&path) else {
        return FileConfig::default();
    };
    match toml::from_str(&text) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: ignoring malformed {}: {e}", path.display());
            FileConfig::default()
        }
    }
}
