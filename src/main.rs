use anyhow::{Context, Result, bail};
use apibase::apis::{mistral, rootme};
use apibase::runtime::RealRuntime;
use apibase::settings::Settings;
use apibase::{Api, Call, ConfigUpdate};
use clap::Parser;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// apibase - declarative HTTP API clients
///
/// Calls the bundled Root-Me and Mistral endpoints with session pooling and
/// automatic retries.
///
/// API keys are read from ROOTME_API_KEY / MISTRAL_API_KEY, or from the
/// `rootme_key` / `mistral_key` fields of the settings file.
///
/// Examples:
///   apibase rootme challenges -p lang=fr    # List French challenges
///   apibase rootme challenge 5              # Show challenge #5
///   apibase mistral "Explain SQL injection" # Ask the chat model
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to <config dir>/apibase/config.json)
    #[arg(
        long = "config",
        short = 'c',
        env = "APIBASE_CONFIG",
        value_name = "PATH",
        global = true
    )]
    pub config: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long = "base-url", value_name = "URL", global = true)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, value_name = "SECS", global = true)]
    pub timeout: Option<u64>,

    /// Retries after the first attempt
    #[arg(long = "max-retries", value_name = "N", global = true)]
    pub max_retries: Option<u32>,

    /// Base delay between retries in milliseconds
    #[arg(long = "retry-delay-ms", value_name = "MS", global = true)]
    pub retry_delay_ms: Option<u64>,
}

impl Cli {
    fn overrides(&self) -> ConfigUpdate {
        ConfigUpdate {
            base_url: self.base_url.clone(),
            timeout: self.timeout.map(Duration::from_secs),
            max_retries: self.max_retries,
            retry_delay: self.retry_delay_ms.map(Duration::from_millis),
            ..ConfigUpdate::default()
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Call a Root-Me endpoint and print the JSON result
    Rootme(RootmeArgs),

    /// Send a prompt to the Mistral chat completion API
    Mistral(MistralArgs),
}

#[derive(clap::Args, Debug)]
pub struct RootmeArgs {
    /// Endpoint name: challenges, challenge, authors, author, leaderboard, environments, environment
    #[arg(value_name = "ENDPOINT")]
    pub endpoint: String,

    /// Positional route arguments, e.g. the challenge id
    #[arg(value_name = "ARGS")]
    pub args: Vec<String>,

    /// Keyword argument as KEY=VALUE; repeat a key to send a list
    #[arg(short = 'p', long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// API key (overrides environment and settings file)
    #[arg(long = "api-key", value_name = "KEY")]
    pub api_key: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct MistralArgs {
    /// Prompt sent as a single user message
    #[arg(value_name = "PROMPT")]
    pub prompt: String,

    /// Model name
    #[arg(long, default_value = mistral::DEFAULT_MODEL)]
    pub model: String,

    /// API key (overrides environment and settings file)
    #[arg(long = "api-key", value_name = "KEY")]
    pub api_key: Option<String>,
}

/// Parses `KEY=VALUE` pairs. Values that parse as JSON keep their type.
fn parse_params(params: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut kwargs: BTreeMap<String, Value> = BTreeMap::new();
    for param in params {
        let Some((key, raw)) = param.split_once('=') else {
            bail!("Invalid parameter '{}', expected KEY=VALUE", param);
        };
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        match kwargs.remove(key) {
            None => {
                kwargs.insert(key.to_string(), value);
            }
            Some(Value::Array(mut items)) => {
                items.push(value);
                kwargs.insert(key.to_string(), Value::Array(items));
            }
            Some(previous) => {
                kwargs.insert(key.to_string(), Value::Array(vec![previous, value]));
            }
        }
    }
    Ok(kwargs)
}

async fn run_rootme(api: &Api, args: &RootmeArgs) -> Result<()> {
    let call = Call {
        args: args.args.clone(),
        kwargs: parse_params(&args.params)?,
    };
    let result = api
        .invoke(&args.endpoint, &call)
        .await
        .with_context(|| format!("rootme {} failed", args.endpoint))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_mistral(api: &Api, args: &MistralArgs) -> Result<()> {
    let answer = mistral::complete(
        api,
        &args.model,
        &[mistral::ChatMessage::user(args.prompt.as_str())],
    )
    .await
    .context("mistral completion failed")?;
    println!("{}", answer);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let settings = Settings::load(RealRuntime, cli.config.as_deref())?;

    let api = match &cli.command {
        Commands::Rootme(args) => rootme::setup(&settings, args.api_key.as_deref())?,
        Commands::Mistral(args) => mistral::setup(&settings, args.api_key.as_deref())?,
    };
    api.configure(cli.overrides());

    let result = match &cli.command {
        Commands::Rootme(args) => run_rootme(&api, args).await,
        Commands::Mistral(args) => run_mistral(&api, args).await,
    };
    api.close();
    result
}
