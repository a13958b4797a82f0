//! `restage` command-line interface

use anyhow::{bail, Context};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use restage_core::{run_simulation, SimulationConfig, StudioConfig};
use restage_token::{signing_key_from_seed, IssueRequest, Permissions, TokenService, Validation};
use restage_types::{AccountId, ResourceId};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn cli() -> Command {
    Command::new("restage")
        .version(restage_core::VERSION)
        .about("Metered AI image editing: ledger, edit queue and share links")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .help("Path to a TOML configuration file"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("simulate")
                .about("Run a seeded edit workload and audit the ledger")
                .arg(
                    Arg::new("operations")
                        .long("ops")
                        .default_value("200")
                        .value_parser(value_parser!(u64))
                        .help("Number of edits to submit"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("accounts")
                        .long("accounts")
                        .default_value("3")
                        .value_parser(value_parser!(usize))
                        .help("Number of brokerages"),
                )
                .arg(
                    Arg::new("grant")
                        .long("grant")
                        .default_value("100")
                        .value_parser(value_parser!(u64))
                        .help("Starting credits per brokerage"),
                )
                .arg(
                    Arg::new("failure-rate")
                        .long("failure-rate")
                        .default_value("0.15")
                        .value_parser(value_parser!(f64))
                        .help("Fraction of provider calls that fail"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("token")
                .about("Issue or check share links")
                .subcommand_required(true)
                .arg(
                    Arg::new("secret")
                        .long("secret")
                        .global(true)
                        .env("RESTAGE_SIGNING_SECRET")
                        .help("Signing secret (overrides the config file)"),
                )
                .subcommand(
                    Command::new("issue")
                        .about("Mint a share link")
                        .arg(Arg::new("resource").long("resource").required(true))
                        .arg(Arg::new("account").long("account").required(true))
                        .arg(Arg::new("identity").long("identity").required(true))
                        .arg(
                            Arg::new("ttl-hours")
                                .long("ttl-hours")
                                .value_parser(value_parser!(i64))
                                .help("Lifetime in hours (default from config)"),
                        )
                        .arg(
                            Arg::new("view-only")
                                .long("view-only")
                                .action(ArgAction::SetTrue)
                                .help("Withhold edit permission"),
                        )
                        .arg(
                            Arg::new("reshare")
                                .long("reshare")
                                .action(ArgAction::SetTrue)
                                .help("Allow the holder to re-share"),
                        ),
                )
                .subcommand(
                    Command::new("verify")
                        .about("Validate a share link")
                        .arg(Arg::new("token").required(true)),
                ),
        )
        .subcommand(Command::new("costs").about("Print the credit cost of each edit kind"))
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<StudioConfig> {
    match matches.get_one::<String>("config") {
        Some(path) => StudioConfig::load(path).with_context(|| format!("loading {path}")),
        None => Ok(StudioConfig::default()),
    }
}

fn token_service(args: &ArgMatches, config: &StudioConfig) -> anyhow::Result<TokenService> {
    let secret = args
        .get_one::<String>("secret")
        .cloned()
        .or_else(|| config.signing_secret.clone());
    let Some(secret) = secret else {
        bail!("a signing secret is required: pass --secret, set RESTAGE_SIGNING_SECRET or signing_secret in the config");
    };
    Ok(TokenService::new(signing_key_from_seed(&secret), config.tokens))
}

async fn simulate(args: &ArgMatches) -> anyhow::Result<bool> {
    let config = SimulationConfig {
        seed: *args.get_one::<u64>("seed").context("seed")?,
        operations: *args.get_one::<u64>("operations").context("ops")?,
        accounts: *args.get_one::<usize>("accounts").context("accounts")?,
        starting_grant: *args.get_one::<u64>("grant").context("grant")?,
        failure_rate: *args.get_one::<f64>("failure-rate").context("failure-rate")?,
        max_latency: Duration::from_millis(2),
        ..SimulationConfig::default()
    };

    let report = run_simulation(&config).await?;
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.generate_text());
    }
    Ok(report.passed())
}

fn token(args: &ArgMatches, config: &StudioConfig) -> anyhow::Result<bool> {
    let service = token_service(args, config)?;
    match args.subcommand() {
        Some(("issue", sub)) => {
            let field = |name: &str| -> anyhow::Result<String> {
                sub.get_one::<String>(name)
                    .cloned()
                    .with_context(|| format!("--{name} is required"))
            };
            let mut permissions = if sub.get_flag("view-only") {
                Permissions::view_only()
            } else {
                Permissions::default()
            };
            if sub.get_flag("reshare") {
                permissions = permissions.with_reshare();
            }

            let mut request = IssueRequest::new(
                ResourceId::named(field("resource")?),
                AccountId::named(field("account")?),
                field("identity")?,
            )
            .with_permissions(permissions);
            if let Some(hours) = sub.get_one::<i64>("ttl-hours") {
                let ttl = chrono::Duration::try_hours(*hours).context("--ttl-hours out of range")?;
                request = request.with_ttl(ttl);
            }

            let issued = service.issue(request)?;
            println!("{}", issued.token);
            eprintln!("expires at {}", issued.expires_at);
            Ok(true)
        }
        Some(("verify", sub)) => {
            let token = sub.get_one::<String>("token").context("token")?;
            match service.validate(token) {
                Validation::Valid(claims) => {
                    println!("{}", serde_json::to_string_pretty(&claims)?);
                    Ok(true)
                }
                Validation::Invalid(reason) => {
                    println!("invalid: {reason}");
                    Ok(false)
                }
            }
        }
        _ => bail!("unknown token command"),
    }
}

fn costs(config: &StudioConfig) {
    println!("{:<12} credits", "edit");
    for (kind, cost) in config.costs.entries() {
        println!("{:<12} {cost}", kind.as_str());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    let ok = match matches.subcommand() {
        Some(("simulate", args)) => simulate(args).await?,
        Some(("token", args)) => token(args, &config)?,
        Some(("costs", _)) => {
            costs(&config);
            true
        }
        _ => bail!("unknown command"),
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}
