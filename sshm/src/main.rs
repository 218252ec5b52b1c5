use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;

use sshm_core::cipher;
use sshm_core::config::{AppConfig, Connection, SshKeyEntry};
use sshm_core::keystore::OsKeyStore;
use sshm_core::prompt;
use sshm_ssh::{auth, keygen, session, term};

fn main() -> Result<()> {
    // Reset SIGPIPE to default so piping output to `head` etc. exits cleanly
    // instead of panicking with "broken pipe".
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str).unwrap_or("help");

    match cmd {
        "add" => cmd_add(&args[1..]),
        "edit" => cmd_edit(&args[1..]),
        "remove" | "rm" => cmd_remove(&args[1..]),
        "list" | "ls" => cmd_list(&args[1..]),
        "connect" | "c" => cmd_connect(&args[1..]),
        // key / keys are full aliases for the same subcommand tree
        "keys" | "key" => cmd_keys(&args[1..]),
        "import" => cmd_import(&args[1..]),
        "export" => cmd_export(&args[1..]),
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}");
            print_help();
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        "\
sshm - SSH connection manager with encrypted credential storage

USAGE:
    sshm <command> [args...]

COMMANDS:
    add <name> [options]                Save a connection
    edit <name|id> [options]            Change a saved connection
    remove <name|id> [--yes]            Delete a connection (alias: rm)
    list [--format=<fmt>] [--tag <t>]   List connections (alias: ls)
    connect <name|id> [command...]      Open a shell, or run a one-off command (alias: c)
    keys <subcommand>                   Manage key pairs (alias: key)
      generate [options]                Generate a key pair and register it
      add <name> <path>                 Register an existing private key
      list                              List registered keys
    import <file>                       Merge connections from an exported file
    export [file]                       Write the full config (stdout if no file)
    help                                Show this help

OPTIONS for 'add' and 'edit':
    --host <host>                       Hostname or address
    --user <user>                       Login user
    --port <port>                       Port (default 22)
    --key <path>                        Private key file (takes priority over a password)
    --password                          Prompt for a password, stored encrypted
    --tag <tag>                         Attach a tag (repeatable)
    --description <text>                Free-form note
    edit only:
    --rename <name>                     Change the connection name
    --no-key                            Drop the key file
    --no-password                       Drop the stored password

OPTIONS for 'keys generate':
    --type <rsa|ed25519>                Key type (default ed25519)
    --bits <n>                          RSA modulus size (default 2048, ignored for ed25519)
    --name <name>                       File and registry name (default id_<type>)
    --dir <path>                        Output directory (default ~/.ssh)

OUTPUT FORMATS (--format):
    table                               Aligned columns  [default]
    json                                JSON array (passwords omitted)

NOTES:
    Stored passwords are encrypted with a key held in the OS secret store
    (keychain/keyutils), so an exported file cannot be decrypted on another
    machine.  Key files referenced by --key are never copied or stored.

EXAMPLES:
    sshm add web1 --host web1.example.com --user deploy --password
    sshm add build --host 10.0.0.7 --user ci --key ~/.ssh/id_ed25519 --tag infra
    sshm connect web1
    sshm connect web1 uptime
    sshm keys generate --type ed25519 --name deploy_key
    sshm list --format=json --tag infra
    sshm export backup.toml"
    );
}

fn print_keys_help() {
    println!(
        "\
sshm keys - manage key pairs

USAGE:
    sshm keys <subcommand> [args...]
    sshm key <subcommand> [args...]     (alias)

SUBCOMMANDS:
    generate [options]        Generate a pair, write it 0600/0644, register it
    add <name> <path>         Register an existing private key file
    list                      List registered keys

The private key is written in PEM (PKCS#1 for RSA, PKCS#8 for ed25519) and
the public key as an OpenSSH authorized_keys line next to it ('.pub')."
    );
}

// ---------------------------------------------------------------------------
// Flag parsing
// ---------------------------------------------------------------------------

/// Parsed `--flag value` / `--flag=value` / bare-switch arguments, plus the
/// positionals that were left over.
struct ParsedArgs {
    positional: Vec<String>,
    flags: Vec<(String, Option<String>)>,
}

impl ParsedArgs {
    fn value_of(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .rev()
            .find(|(k, _)| k == name)
            .and_then(|(_, v)| v.as_deref())
    }

    fn is_set(&self, name: &str) -> bool {
        self.flags.iter().any(|(k, _)| k == name)
    }

    fn values_of<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.flags
            .iter()
            .filter(move |(k, _)| k == name)
            .filter_map(|(_, v)| v.as_deref())
    }
}

/// `takes_value` lists the flags that consume the following argument; any
/// other `--flag` is a bare switch.
fn parse_args(args: &[String], takes_value: &[&str]) -> Result<ParsedArgs> {
    let mut parsed = ParsedArgs {
        positional: Vec::new(),
        flags: Vec::new(),
    };
    let mut i = 0;
    while i < args.len() {
        let arg = &args[i];
        if let Some(flag) = arg.strip_prefix("--") {
            if let Some((name, value)) = flag.split_once('=') {
                parsed.flags.push((name.to_string(), Some(value.to_string())));
            } else if takes_value.contains(&flag) {
                i += 1;
                let value = args
                    .get(i)
                    .with_context(|| format!("--{flag} requires a value"))?;
                parsed.flags.push((flag.to_string(), Some(value.clone())));
            } else {
                parsed.flags.push((flag.to_string(), None));
            }
        } else {
            parsed.positional.push(arg.clone());
        }
        i += 1;
    }
    Ok(parsed)
}

fn load_config() -> Result<(PathBuf, AppConfig)> {
    let path = AppConfig::default_path()?;
    let config = AppConfig::load(&path)?;
    Ok((path, config))
}

/// Prompt for a password twice and encrypt it for storage.
fn prompt_and_encrypt_password() -> Result<String> {
    let first = prompt::read_hidden("Password: ")?;
    let second = prompt::read_hidden("Repeat password: ")?;
    if *first != *second {
        bail!("passwords do not match");
    }
    Ok(cipher::encrypt(&OsKeyStore, &first)?)
}

// ---------------------------------------------------------------------------
// add / edit / remove
// ---------------------------------------------------------------------------

const CONN_VALUE_FLAGS: &[&str] = &[
    "host",
    "user",
    "port",
    "key",
    "tag",
    "description",
    "rename",
];

fn cmd_add(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, CONN_VALUE_FLAGS)?;
    let name = parsed
        .positional
        .first()
        .context("usage: sshm add <name> [options]")?;

    let (path, mut config) = load_config()?;

    let host = match parsed.value_of("host") {
        Some(host) => host.to_string(),
        None => prompt::read_line("Host: ")?,
    };
    if host.is_empty() {
        bail!("a host is required");
    }
    let user = match parsed.value_of("user") {
        Some(user) => user.to_string(),
        None => prompt::read_line("User: ")?,
    };
    if user.is_empty() {
        bail!("a user is required");
    }
    let port: u16 = match parsed.value_of("port") {
        Some(raw) => raw.parse().with_context(|| format!("invalid port: {raw}"))?,
        None => 22,
    };

    let key_path = parsed.value_of("key").map(expand_tilde);
    let password = if parsed.is_set("password") {
        if key_path.is_some() {
            bail!("--key and --password are mutually exclusive; a key takes priority anyway");
        }
        Some(prompt_and_encrypt_password()?)
    } else {
        None
    };

    let conn = Connection {
        host,
        port,
        user,
        key_path,
        password,
        tags: parsed.values_of("tag").map(str::to_string).collect(),
        description: parsed.value_of("description").map(str::to_string),
        created_at: Some(Utc::now()),
        ..Connection::default()
    };

    if !config.add_connection(name, conn) {
        bail!("a connection named '{name}' already exists (try 'sshm edit {name}')");
    }
    config.save(&path)?;
    println!("Added connection '{name}'.");
    Ok(())
}

fn cmd_edit(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, CONN_VALUE_FLAGS)?;
    let ident = parsed
        .positional
        .first()
        .context("usage: sshm edit <name|id> [options]")?;

    let (path, mut config) = load_config()?;
    let name = match config.find(ident) {
        Some((name, _)) => name.to_string(),
        None => bail!("no connection named '{ident}'"),
    };

    // Collect the new password (interactive) before taking the mutable
    // borrow, so a mismatch aborts without touching the entry.
    let new_password = if parsed.is_set("password") {
        Some(prompt_and_encrypt_password()?)
    } else {
        None
    };

    let conn = config
        .connections
        .get_mut(&name)
        .context("connection disappeared during edit")?;

    if let Some(host) = parsed.value_of("host") {
        conn.host = host.to_string();
    }
    if let Some(user) = parsed.value_of("user") {
        conn.user = user.to_string();
    }
    if let Some(raw) = parsed.value_of("port") {
        conn.port = raw.parse().with_context(|| format!("invalid port: {raw}"))?;
    }
    if let Some(key) = parsed.value_of("key") {
        conn.key_path = Some(expand_tilde(key));
    }
    if parsed.is_set("no-key") {
        conn.key_path = None;
    }
    if let Some(password) = new_password {
        conn.password = Some(password);
    }
    if parsed.is_set("no-password") {
        conn.password = None;
    }
    let tags: Vec<String> = parsed.values_of("tag").map(str::to_string).collect();
    if !tags.is_empty() {
        conn.tags = tags;
    }
    if let Some(description) = parsed.value_of("description") {
        conn.description = Some(description.to_string());
    }

    if let Some(new_name) = parsed.value_of("rename") {
        if config.connections.contains_key(new_name) {
            bail!("a connection named '{new_name}' already exists");
        }
        let mut conn = config
            .connections
            .remove(&name)
            .context("connection disappeared during rename")?;
        conn.name = new_name.to_string();
        config.connections.insert(new_name.to_string(), conn);
    }

    config.save(&path)?;
    println!("Updated connection '{name}'.");
    Ok(())
}

fn cmd_remove(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &[])?;
    let ident = parsed
        .positional
        .first()
        .context("usage: sshm remove <name|id> [--yes]")?;

    let (path, mut config) = load_config()?;
    let name = match config.find(ident) {
        Some((name, _)) => name.to_string(),
        None => bail!("no connection named '{ident}'"),
    };

    if !parsed.is_set("yes") && !prompt::confirm(&format!("Remove connection '{name}'?"))? {
        println!("Aborted.");
        return Ok(());
    }

    config.connections.remove(&name);
    config.save(&path)?;
    println!("Removed connection '{name}'.");
    Ok(())
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

fn cmd_list(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &["format", "tag"])?;
    let format = parsed.value_of("format").unwrap_or("table");
    let tag = parsed.value_of("tag");

    let (_, config) = load_config()?;
    let connections: Vec<&Connection> = config
        .connections
        .values()
        .filter(|c| tag.is_none_or(|t| c.tags.iter().any(|have| have == t)))
        .collect();

    match format {
        "table" => print_conn_table(&connections),
        "json" => print_conn_json(&connections)?,
        other => {
            eprintln!("unknown format '{other}': use table or json");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn auth_label(conn: &Connection) -> &'static str {
    if conn.key_path.is_some() {
        "key"
    } else if conn.password.is_some() {
        "password"
    } else {
        "-"
    }
}

fn print_conn_table(connections: &[&Connection]) {
    if connections.is_empty() {
        println!("No connections saved.");
        return;
    }

    let dest: Vec<String> = connections
        .iter()
        .map(|c| format!("{}@{}:{}", c.user, c.host, c.port))
        .collect();

    let name_w = connections
        .iter()
        .map(|c| c.name.len())
        .max()
        .unwrap_or(4)
        .max(4);
    let dest_w = dest.iter().map(String::len).max().unwrap_or(11).max(11);

    println!("{:<4}  {:<name_w$}  {:<dest_w$}  {:<8}  TAGS", "ID", "NAME", "DESTINATION", "AUTH");
    println!("{}", "-".repeat(4 + name_w + dest_w + 8 + 12));
    for (conn, dest) in connections.iter().zip(&dest) {
        println!(
            "{:<4}  {:<name_w$}  {:<dest_w$}  {:<8}  {}",
            conn.id,
            conn.name,
            dest,
            auth_label(conn),
            conn.tags.join(","),
        );
    }
}

/// JSON output never includes the password envelope; only whether one is set.
fn print_conn_json(connections: &[&Connection]) -> Result<()> {
    let items: Vec<serde_json::Value> = connections
        .iter()
        .map(|conn| {
            serde_json::json!({
                "id": conn.id,
                "name": conn.name,
                "host": conn.host,
                "port": conn.port,
                "user": conn.user,
                "auth": auth_label(conn),
                "key_path": conn.key_path,
                "tags": conn.tags,
                "description": conn.description,
                "last_used": conn.last_used,
            })
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// connect
// ---------------------------------------------------------------------------

fn cmd_connect(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &[])?;
    let ident = parsed
        .positional
        .first()
        .context("usage: sshm connect <name|id> [command...]")?;
    let command = match &parsed.positional[1..] {
        [] => None,
        rest => Some(rest.join(" ")),
    };

    let (path, mut config) = load_config()?;
    let conn = match config.find(ident) {
        Some((_, conn)) => conn.clone(),
        None => bail!("no connection named '{ident}' (see 'sshm list')"),
    };

    let mut passphrase_prompt =
        || prompt::read_hidden(&format!("Passphrase for {}: ", display_key_path(&conn)));
    let methods = auth::resolve(&conn, &OsKeyStore, &mut passphrase_prompt)?;

    term::install_restore_handler();
    eprintln!("Connecting to {}@{}:{}...", conn.user, conn.host, conn.port);

    let status = match command {
        Some(command) => session::run_command(&conn, methods, &command)?,
        None => session::run_shell(&conn, methods)?,
    };

    if let Some(entry) = config.connections.get_mut(&conn.name) {
        entry.last_used = Some(Utc::now());
        // The session already ran; a bookkeeping failure should not turn
        // its outcome into an error.
        if let Err(err) = config.save(&path) {
            eprintln!("warning: could not record last use: {err}");
        }
    }

    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}

fn display_key_path(conn: &Connection) -> String {
    conn.key_path
        .as_deref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// keys subcommand tree
// ---------------------------------------------------------------------------

fn cmd_keys(args: &[String]) -> Result<()> {
    let sub = args.first().map(String::as_str).unwrap_or("list");
    match sub {
        "generate" | "gen" => cmd_keys_generate(&args[1..]),
        "add" => cmd_keys_add(&args[1..]),
        "list" | "ls" => cmd_keys_list(),
        "help" | "--help" | "-h" => {
            print_keys_help();
            Ok(())
        }
        other => {
            eprintln!("unknown keys subcommand: {other}");
            print_keys_help();
            std::process::exit(1);
        }
    }
}

fn cmd_keys_generate(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &["type", "bits", "name", "dir"])?;

    let kind: keygen::KeyKind = parsed.value_of("type").unwrap_or("ed25519").parse()?;
    let bits: usize = match parsed.value_of("bits") {
        Some(raw) => raw.parse().with_context(|| format!("invalid bit size: {raw}"))?,
        None => 0,
    };
    let name = parsed
        .value_of("name")
        .map(str::to_string)
        .unwrap_or_else(|| format!("id_{}", kind.as_str()));
    let dir = match parsed.value_of("dir") {
        Some(dir) => expand_tilde(dir),
        None => keygen::default_key_dir().context("cannot determine a key directory (HOME not set)")?,
    };

    let (path, mut config) = load_config()?;
    if config.ssh_keys.contains_key(&name) {
        bail!("a key named '{name}' is already registered");
    }
    let private_path = dir.join(&name);
    if private_path.exists() {
        bail!("{} already exists; pick another --name or remove it first", private_path.display());
    }

    eprintln!("Generating {} key pair...", kind.as_str());
    let pair = keygen::KeyPair::generate(kind, bits)?;

    keygen::ensure_key_dir(&dir)?;
    let public_path = dir.join(format!("{name}.pub"));
    pair.write_private(&private_path)?;
    pair.write_public(&public_path)?;

    config.ssh_keys.insert(
        name.clone(),
        SshKeyEntry {
            name: name.clone(),
            path: private_path.clone(),
            kind: kind.as_str().to_string(),
        },
    );
    config.save(&path)?;

    println!("Private key: {}", private_path.display());
    println!("Public key:  {}", public_path.display());
    println!("Type:        {} ({} bits)", kind.as_str(), pair.bits());
    println!("Use it with: sshm edit <name> --key {}", private_path.display());
    Ok(())
}

fn cmd_keys_add(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &[])?;
    let [name, raw_path] = &parsed.positional[..] else {
        bail!("usage: sshm keys add <name> <path>");
    };
    let key_path = expand_tilde(raw_path);
    if !key_path.is_file() {
        bail!("{} is not a file", key_path.display());
    }

    let (path, mut config) = load_config()?;
    if config.ssh_keys.contains_key(name) {
        bail!("a key named '{name}' is already registered");
    }
    config.ssh_keys.insert(
        name.clone(),
        SshKeyEntry {
            name: name.clone(),
            path: key_path.clone(),
            kind: detect_key_kind(&key_path),
        },
    );
    config.save(&path)?;
    println!("Registered key '{name}' -> {}", key_path.display());
    Ok(())
}

/// Best-effort type detection from the PEM header; wrong guesses only
/// affect the `keys list` display.
fn detect_key_kind(path: &Path) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return "unknown".to_string();
    };
    if text.contains("BEGIN RSA PRIVATE KEY") {
        "rsa".to_string()
    } else if let Ok(key) = ssh_key::PrivateKey::from_openssh(&text) {
        key.algorithm().as_str().trim_start_matches("ssh-").to_string()
    } else {
        "unknown".to_string()
    }
}

fn cmd_keys_list() -> Result<()> {
    let (_, config) = load_config()?;
    if config.ssh_keys.is_empty() {
        println!("No keys registered.");
        return Ok(());
    }
    let name_w = config.ssh_keys.keys().map(String::len).max().unwrap_or(4).max(4);
    let kind_w = config
        .ssh_keys
        .values()
        .map(|k| k.kind.len())
        .max()
        .unwrap_or(4)
        .max(4);
    println!("{:<name_w$}  {:<kind_w$}  PATH", "NAME", "KIND");
    println!("{}", "-".repeat(name_w + kind_w + 8));
    for entry in config.ssh_keys.values() {
        println!("{:<name_w$}  {:<kind_w$}  {}", entry.name, entry.kind, entry.path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// import / export
// ---------------------------------------------------------------------------

fn cmd_import(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &[])?;
    let file = parsed
        .positional
        .first()
        .context("usage: sshm import <file>")?;

    let text = std::fs::read_to_string(file).with_context(|| format!("cannot read {file}"))?;
    let incoming: AppConfig =
        toml::from_str(&text).with_context(|| format!("cannot parse {file}"))?;

    let (path, mut config) = load_config()?;
    let outcome = config.merge(incoming);
    config.save(&path)?;

    println!("Imported {} connection(s), skipped {} existing.", outcome.added, outcome.skipped);
    if outcome.added > 0 {
        println!("Note: encrypted passwords from another machine will not decrypt here.");
    }
    Ok(())
}

fn cmd_export(args: &[String]) -> Result<()> {
    let parsed = parse_args(args, &[])?;
    let (_, config) = load_config()?;
    let text = toml::to_string_pretty(&config)?;

    match parsed.positional.first() {
        Some(file) => {
            let out = PathBuf::from(file);
            config.save(&out)?;
            println!("Exported {} connection(s) to {file}.", config.connections.len());
            println!("Passwords stay encrypted; they decrypt only with this machine's store key.");
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn flags_with_values_and_switches_parse() {
        let parsed = parse_args(
            &args(&["web1", "--host", "h", "--port=2222", "--password", "--tag", "a", "--tag=b"]),
            &["host", "port", "tag"],
        )
        .unwrap();
        assert_eq!(parsed.positional, vec!["web1"]);
        assert_eq!(parsed.value_of("host"), Some("h"));
        assert_eq!(parsed.value_of("port"), Some("2222"));
        assert!(parsed.is_set("password"));
        let tags: Vec<&str> = parsed.values_of("tag").collect();
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn missing_flag_value_is_an_error() {
        assert!(parse_args(&args(&["--host"]), &["host"]).is_err());
    }

    #[test]
    fn repeated_value_flag_takes_the_last() {
        let parsed = parse_args(&args(&["--port", "22", "--port", "2222"]), &["port"]).unwrap();
        assert_eq!(parsed.value_of("port"), Some("2222"));
    }

    #[test]
    fn tilde_paths_expand_against_home() {
        let expanded = expand_tilde("~/keys/id_ed25519");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join("keys/id_ed25519"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}
