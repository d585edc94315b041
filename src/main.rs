// dssh CLI - SSH to many hosts through jump chains

use std::path::PathBuf;
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::{Args, CommandFactory, Parser, Subcommand};
use colored::*;
use tracing::debug;

use dssh::executor::agent::{export_auth_sock, fix_agent, FORWARDED_SOCKET_ROOT};
use dssh::executor::{
    ActionSpec, Authenticator, FailurePolicy, Orchestrator, RunSummary, SshRunner, TaskBuilder,
    TerminalPrompter,
};
use dssh::inventory::{parse_tags, AliasEntry, AliasTable, Overlay, Resolver, SshConfig};
use dssh::output::{format_table, DsshError, TerminalOutput};

#[derive(Parser)]
#[command(
    name = "dssh",
    about = "SSH to many hosts, through jump hosts",
    version,
    author,
    disable_colored_help = true,
    term_width = 0,
    args_conflicts_with_subcommands = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// Tool config file [default: ~/.dssh.yaml]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SSH client config file [default: ~/.ssh/config]
    #[arg(long, global = true)]
    ssh_config: Option<PathBuf>,

    /// Log level for diagnostics on stderr (RUST_LOG overrides)
    #[arg(short = 'l', long, global = true, default_value = dssh::logging::DEFAULT_LEVEL)]
    log_level: String,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum Commands {
    /// List or edit host aliases
    #[command(args_conflicts_with_subcommands = true)]
    Host {
        #[command(subcommand)]
        action: Option<HostAction>,

        #[command(flatten)]
        filter: HostFilter,
    },

    /// Download a file or directory from one host
    Get {
        /// Host alias or user@host:port
        host: String,

        /// Remote path
        remote: String,

        /// Local path
        local: PathBuf,

        #[command(flatten)]
        conn: ConnArgs,
    },

    /// Re-point the agent socket link at the newest forwarded agent
    FixAgent,
}

#[derive(Subcommand)]
#[command(disable_colored_help = true)]
enum HostAction {
    /// List host aliases
    List(HostFilter),

    /// Add a host alias
    Add(HostEntryArgs),

    /// Change fields of an existing host alias
    Update(HostEntryArgs),

    /// Remove a host alias
    Del {
        /// Alias name
        #[arg(long)]
        name: String,
    },
}

#[derive(Args, Default)]
struct HostFilter {
    /// Only this alias
    #[arg(long)]
    name: Option<String>,

    /// Only aliases logging in as this user
    #[arg(long)]
    user: Option<String>,

    /// Only aliases carrying any of these tags (comma-separated)
    #[arg(short = 't', long)]
    tags: Option<String>,

    /// Print completion candidates only
    #[arg(long)]
    names: bool,
}

#[derive(Args)]
struct HostEntryArgs {
    /// Alias name
    #[arg(long)]
    name: String,

    /// Address, user@host:port shorthand allowed
    #[arg(long)]
    addr: Option<String>,

    #[arg(short = 'u', long)]
    user: Option<String>,

    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Jump hosts (comma-separated), or "none"
    #[arg(short = 'J', long)]
    jump: Option<String>,

    /// Tags (comma-separated)
    #[arg(short = 't', long)]
    tags: Option<String>,

    /// Connect timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

/// Overrides for this invocation
#[derive(Args, Default)]
struct ConnArgs {
    /// Login user
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Jump hosts (comma-separated), or "none"
    #[arg(short = 'J', long)]
    jump: Option<String>,

    /// Private key file (repeatable)
    #[arg(short = 'i', long = "identity")]
    identity: Vec<PathBuf>,

    /// Network address replacing the target's
    #[arg(long)]
    addr: Option<String>,

    /// Connect timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,
}

impl ConnArgs {
    fn overlay(&self) -> Overlay {
        Overlay {
            user: self.user.clone(),
            port: self.port,
            jump: self.jump.clone(),
            address: self.addr.clone(),
            identity_files: self.identity.clone(),
            timeout: self.timeout,
        }
    }
}

#[derive(Args, Default)]
struct RunArgs {
    /// Host aliases or user@host:port (comma-separated allowed)
    hosts: Vec<String>,

    /// Target host (repeatable)
    #[arg(long = "host")]
    host_flags: Vec<String>,

    /// Select every host carrying any of these tags ("all" for every host)
    #[arg(short = 't', long, value_delimiter = ',')]
    tags: Vec<String>,

    #[command(flatten)]
    conn: ConnArgs,

    /// Command to run
    #[arg(short = 'c', long = "command")]
    remote_command: Option<String>,

    /// Local script to run
    #[arg(short = 's', long)]
    script: Option<PathBuf>,

    /// Module to run from the modules directory
    #[arg(short = 'm', long)]
    module: Option<String>,

    /// Local path to upload
    #[arg(long, requires = "put_dest")]
    put_src: Option<PathBuf>,

    /// Remote upload destination
    #[arg(long, requires = "put_src")]
    put_dest: Option<String>,

    /// Remote path to download
    #[arg(long, requires = "get_dest")]
    get_src: Option<String>,

    /// Local download destination
    #[arg(long, requires = "get_src")]
    get_dest: Option<PathBuf>,

    /// Keep going when a host fails
    #[arg(short = 'f', long)]
    force: bool,

    /// Hosts to run at once (runs stay sequential)
    #[arg(long, default_value = "1")]
    parallel: usize,
}

impl RunArgs {
    fn targets(&self) -> Result<&[String], clap::Error> {
        if !self.hosts.is_empty() && !self.host_flags.is_empty() {
            return Err(Cli::command().error(
                ErrorKind::ArgumentConflict,
                "host name and args can not be used together",
            ));
        }
        if self.hosts.is_empty() {
            Ok(&self.host_flags)
        } else {
            Ok(&self.hosts)
        }
    }

    fn action(&self) -> ActionSpec {
        ActionSpec {
            command: self.remote_command.clone(),
            script: self.script.clone(),
            module: self.module.clone(),
            upload: self.put_src.clone().zip(self.put_dest.clone()),
            download: self.get_src.clone().zip(self.get_dest.clone()),
        }
    }
}

/// Loaded configuration shared by every command
struct Context {
    table: AliasTable,
    table_path: Option<PathBuf>,
    ssh_config: SshConfig,
}

impl Context {
    fn load(config: Option<PathBuf>, ssh_config: Option<PathBuf>) -> Result<Self, DsshError> {
        let required = config.is_some();
        let table_path = config.or_else(AliasTable::default_path);
        let table = match &table_path {
            Some(path) => AliasTable::load(path, required)?,
            None => AliasTable::default(),
        };

        let ssh_config = match ssh_config.or_else(SshConfig::default_path) {
            Some(path) => SshConfig::load(&path)?,
            None => SshConfig::empty(),
        };

        Ok(Context {
            table,
            table_path,
            ssh_config,
        })
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(&self.table, &self.ssh_config)
    }

    fn save(&self) -> Result<(), DsshError> {
        let path = self.table_path.as_ref().ok_or_else(|| DsshError::Config {
            message: "no config file location".to_string(),
            path: None,
            suggestion: Some("Pass --config <path>".to_string()),
        })?;
        self.table.save(path)
    }

    /// Link location for `fix-agent`; never the live `$SSH_AUTH_SOCK`
    fn agent_link(&self) -> Option<PathBuf> {
        self.table
            .ssh_auth_sock
            .clone()
            .or_else(|| dirs::home_dir().map(|h| h.join(".ssh").join("ssh_auth_sock")))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    dssh::logging::init(&cli.log_level);

    let result = match Context::load(cli.config, cli.ssh_config) {
        Ok(ctx) => dispatch(ctx, cli.command, cli.run).await,
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        eprintln!("{}", e);
    }
    std::process::exit(exit_code(&result));
}

/// Non-zero only when the command returned an error; failures a forced run
/// skipped past are already in the recap
fn exit_code(result: &Result<Option<RunSummary>, DsshError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => 1,
    }
}

async fn dispatch(
    ctx: Context,
    command: Option<Commands>,
    run: RunArgs,
) -> Result<Option<RunSummary>, DsshError> {
    if let Some(sock) = ctx.table.ssh_auth_sock() {
        export_auth_sock(&sock);
    }

    match command {
        None => {
            let targets = run.targets().unwrap_or_else(|e| e.exit());
            let overlay = run.conn.overlay().over(&ctx.table.overlay);
            let resolver = ctx.resolver();

            let hosts = resolver.select(targets, run.tags.as_slice(), &overlay)?;

            let builder = TaskBuilder::new(ctx.table.modules_dir(), run.action());
            let policy = FailurePolicy::from_force(run.force);
            run_tasks(builder, hosts, policy, run.parallel).await.map(Some)
        }
        Some(Commands::Get {
            host,
            remote,
            local,
            conn,
        }) => {
            let overlay = conn.overlay().over(&ctx.table.overlay);
            let target = ctx.resolver().resolve(&host, &overlay)?;
            let spec = ActionSpec {
                download: Some((remote, local)),
                ..ActionSpec::default()
            };

            let builder = TaskBuilder::new(ctx.table.modules_dir(), spec);
            run_tasks(builder, vec![target], FailurePolicy::Abort, 1)
                .await
                .map(Some)
        }
        Some(Commands::Host { action, filter }) => {
            host_command(ctx, action.unwrap_or(HostAction::List(filter)))?;
            Ok(None)
        }
        Some(Commands::FixAgent) => {
            fix_agent_command(&ctx)?;
            Ok(None)
        }
    }
}

async fn run_tasks(
    builder: TaskBuilder,
    hosts: Vec<dssh::Host>,
    policy: FailurePolicy,
    parallel: usize,
) -> Result<RunSummary, DsshError> {
    if hosts.is_empty() {
        return Err(DsshError::NoTargets);
    }
    let tasks = builder.build_all(hosts)?;
    debug!(count = tasks.len(), "tasks built");

    let output = TerminalOutput::new();
    let auth = Authenticator::new(Arc::new(TerminalPrompter));
    let runner = SshRunner::new(auth, output.clone());

    Orchestrator::new(runner, policy)
        .with_output(output)
        .with_parallel(parallel)
        .run(&tasks)
        .await
}

fn host_command(mut ctx: Context, action: HostAction) -> Result<(), DsshError> {
    match action {
        HostAction::List(filter) => list_hosts(&ctx, &filter),
        HostAction::Add(args) => {
            let addr = args.addr.clone().ok_or_else(|| DsshError::Config {
                message: "--addr is required".to_string(),
                path: None,
                suggestion: Some("dssh host add --name <name> --addr <user@host:port>".to_string()),
            })?;
            let mut entry = AliasEntry::new(addr);
            apply_entry_args(&mut entry, &args)?;

            ctx.table.add(&args.name, entry)?;
            ctx.save()?;
            println!("{} {}", "Added".green(), args.name);
            Ok(())
        }
        HostAction::Update(args) => {
            // Parse first so a bad tag list leaves the entry untouched
            let mut patch = AliasEntry::new(String::new());
            apply_entry_args(&mut patch, &args)?;

            ctx.table.update(&args.name, |entry| {
                if let Some(addr) = &args.addr {
                    entry.addr = addr.clone();
                }
                if args.user.is_some() {
                    entry.user = patch.user;
                }
                if args.port.is_some() {
                    entry.port = patch.port;
                }
                if args.jump.is_some() {
                    entry.jump = patch.jump;
                }
                if args.tags.is_some() {
                    entry.tags = patch.tags;
                }
                if args.timeout.is_some() {
                    entry.timeout = patch.timeout;
                }
            })?;
            ctx.save()?;
            println!("{} {}", "Updated".green(), args.name);
            Ok(())
        }
        HostAction::Del { name } => {
            ctx.table.remove(&name)?;
            ctx.save()?;
            println!("{} {}", "Removed".green(), name);
            Ok(())
        }
    }
}

fn apply_entry_args(entry: &mut AliasEntry, args: &HostEntryArgs) -> Result<(), DsshError> {
    entry.user = args.user.clone();
    entry.port = args.port;
    entry.jump = args.jump.clone();
    entry.timeout = args.timeout;
    if let Some(tags) = &args.tags {
        entry.tags = parse_tags(tags)?;
    }
    Ok(())
}

fn list_hosts(ctx: &Context, filter: &HostFilter) -> Result<(), DsshError> {
    if filter.names {
        for name in ctx.resolver().candidate_names() {
            println!("{}", name);
        }
        return Ok(());
    }

    let tags = filter.tags.as_deref().map(parse_tags).transpose()?;
    let rows = host_rows(&ctx.table, filter.name.as_deref(), filter.user.as_deref(), tags.as_ref());
    print!(
        "{}",
        format_table(&["NAME", "USER", "ADDR", "PORT", "JUMP", "TAGS", "TIMEOUT"], &rows)
    );
    Ok(())
}

fn host_rows(
    table: &AliasTable,
    name: Option<&str>,
    user: Option<&str>,
    tags: Option<&std::collections::BTreeSet<String>>,
) -> Vec<Vec<String>> {
    table
        .filter(name, user, tags)
        .into_iter()
        .map(|(name, entry)| {
            let (user, host, port) = match entry.address() {
                Ok(addr) => (
                    addr.user.unwrap_or_default(),
                    addr.host,
                    addr.port.map(|p| p.to_string()).unwrap_or_default(),
                ),
                Err(_) => (String::new(), entry.addr.clone(), String::new()),
            };
            vec![
                name.to_string(),
                user,
                host,
                port,
                entry.jump.clone().unwrap_or_default(),
                entry.tags.iter().cloned().collect::<Vec<_>>().join(","),
                entry.timeout.map(|t| t.to_string()).unwrap_or_default(),
            ]
        })
        .collect()
}

fn fix_agent_command(ctx: &Context) -> Result<(), DsshError> {
    let link = ctx.agent_link().ok_or_else(|| DsshError::Config {
        message: "no agent socket location".to_string(),
        path: None,
        suggestion: Some("Set sshAuthSock in the config file".to_string()),
    })?;

    match fix_agent(&link, std::path::Path::new(FORWARDED_SOCKET_ROOT))? {
        Some(socket) => println!(
            "{} {} -> {}",
            "Linked".green(),
            link.display(),
            socket.display()
        ),
        None => println!(
            "{} no forwarded agent socket under {}",
            "Nothing to do:".yellow(),
            FORWARDED_SOCKET_ROOT
        ),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dssh::executor::TaskFailure;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("dssh").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_and_host_flag_conflict() {
        let cli = parse(&["web1", "--host", "web2"]);
        let err = cli.run.targets().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
        assert!(err.to_string().contains("host name and args can not be used together"));

        let cli = parse(&["--host", "web1", "--host", "web2,web3"]);
        assert_eq!(cli.run.targets().unwrap(), ["web1", "web2,web3"]);
    }

    #[test]
    fn test_transfer_needs_both_ends() {
        assert!(Cli::try_parse_from(["dssh", "web1", "--put-src", "app.tar"]).is_err());
        assert!(Cli::try_parse_from(["dssh", "web1", "--get-dest", "/tmp/x"]).is_err());

        let cli = parse(&["web1", "--put-src", "app.tar", "--put-dest", "/srv/app.tar"]);
        assert_eq!(
            cli.run.action().upload,
            Some((PathBuf::from("app.tar"), "/srv/app.tar".to_string()))
        );
    }

    #[test]
    fn test_overlay_flags() {
        let cli = parse(&[
            "web1", "-u", "ops", "-p", "2200", "-J", "bastion", "-i", "a.key", "-i", "b.key",
            "--addr", "10.9.9.9", "--timeout", "5",
        ]);
        let overlay = cli.run.conn.overlay();
        assert_eq!(overlay.user.as_deref(), Some("ops"));
        assert_eq!(overlay.port, Some(2200));
        assert_eq!(overlay.jump.as_deref(), Some("bastion"));
        assert_eq!(overlay.address.as_deref(), Some("10.9.9.9"));
        assert_eq!(
            overlay.identity_files,
            vec![PathBuf::from("a.key"), PathBuf::from("b.key")]
        );
        assert_eq!(overlay.timeout, Some(5));
    }

    #[test]
    fn test_tags_split_on_commas() {
        let cli = parse(&["-t", "web,db", "-c", "uptime", "-f"]);
        assert_eq!(cli.run.tags, vec!["web", "db"]);
        assert_eq!(cli.run.action().command.as_deref(), Some("uptime"));
        assert!(cli.run.force);
        assert!(cli.run.targets().unwrap().is_empty());
    }

    #[test]
    fn test_subcommands() {
        let cli = parse(&["get", "web1", "/var/log/app.log", "app.log", "-u", "ops"]);
        match cli.command {
            Some(Commands::Get {
                host, remote, conn, ..
            }) => {
                assert_eq!(host, "web1");
                assert_eq!(remote, "/var/log/app.log");
                assert_eq!(conn.user.as_deref(), Some("ops"));
            }
            _ => panic!("expected get"),
        }

        let cli = parse(&["host", "--names"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Host { action: None, filter }) if filter.names
        ));

        let cli = parse(&["host", "add", "--name", "db1", "--addr", "dba@10.0.0.5", "-t", "db"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Host { action: Some(HostAction::Add(_)), .. })
        ));
    }

    #[test]
    fn test_host_rows() {
        let table = AliasTable::parse(
            r#"
hosts:
  web1:
    addr: deploy@10.0.0.1:2222
    tags: [web]
  db1:
    addr: 10.0.0.5
    jump: bastion
    tags: db,prod
    timeout: 7
"#,
        )
        .unwrap();

        let rows = host_rows(&table, None, None, None);
        assert_eq!(
            rows,
            vec![
                vec!["db1", "", "10.0.0.5", "", "bastion", "db,prod", "7"],
                vec!["web1", "deploy", "10.0.0.1", "2222", "", "web", ""],
            ]
        );

        let web = parse_tags("web").unwrap();
        assert_eq!(host_rows(&table, None, None, Some(&web)).len(), 1);
        assert_eq!(host_rows(&table, None, Some("deploy"), None).len(), 1);
    }

    #[test]
    fn test_host_update_keeps_unset_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dssh.yaml");
        std::fs::write(&path, "hosts:\n  web1:\n    addr: 10.0.0.1\n    tags: [web]\n    timeout: 3\n")
            .unwrap();

        let ctx = Context::load(Some(path.clone()), Some(dir.path().join("none"))).unwrap();
        let cli = parse(&["host", "update", "--name", "web1", "-u", "ops"]);
        let Some(Commands::Host { action: Some(action), .. }) = cli.command else {
            panic!("expected host update");
        };
        host_command(ctx, action).unwrap();

        let table = AliasTable::load(&path, true).unwrap();
        let entry = table.get("web1").unwrap();
        assert_eq!(entry.user.as_deref(), Some("ops"));
        assert_eq!(entry.timeout, Some(3));
        assert!(entry.tags.contains("web"));
    }

    #[test]
    fn test_exit_code_follows_returned_error() {
        let forced = RunSummary {
            total: 2,
            completed: 0,
            failed: vec![
                TaskFailure {
                    index: 0,
                    target: "ops@127.0.0.1:1".to_string(),
                    message: "Connection refused".to_string(),
                },
                TaskFailure {
                    index: 1,
                    target: "ops@127.0.0.1:2".to_string(),
                    message: "Connection refused".to_string(),
                },
            ],
            nonzero_exits: Vec::new(),
        };
        assert!(forced.has_failures());
        assert_eq!(exit_code(&Ok(Some(forced))), 0);
        assert_eq!(exit_code(&Ok(None)), 0);
        assert_eq!(exit_code(&Err(DsshError::NoTargets)), 1);
    }

    #[test]
    fn test_tags_with_trailing_comma() {
        let table = AliasTable::parse("hosts:\n  web1:\n    addr: 10.0.0.1\n    tags: web\n").unwrap();
        let ssh = SshConfig::empty();
        let resolver = Resolver::new(&table, &ssh);

        for flag in ["web,", ",web"] {
            let cli = parse(&["-t", flag, "-c", "id"]);
            let hosts = resolver
                .select(cli.run.targets().unwrap(), cli.run.tags.as_slice(), &Overlay::default())
                .unwrap();
            assert_eq!(hosts.len(), 1, "{flag:?}");
            assert_eq!(hosts[0].name(), "web1");
        }
    }

    #[test]
    fn test_missing_explicit_config() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        assert!(Context::load(Some(missing), None).is_err());
    }
}
