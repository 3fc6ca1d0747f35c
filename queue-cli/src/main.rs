//! queue-cli
//!
//! Call one endpoint of a queue-managed app and print the result as JSON.
//!
//! ```text
//! queue-cli --src http://127.0.0.1:7860 --api-name /predict --arg 5 --arg '"add"' --arg 4
//! ```

use anyhow::{anyhow, Context};
use clap::Parser;
use futures::StreamExt;
use queue_client::{handle_file, Call, Client, ClientOptions, Credentials, Update};
use serde_json::Value;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "queue-cli")]
struct Args {
    /// Root URL of the app
    #[arg(long, env = "QUEUE_CLIENT_SRC")]
    src: String,

    /// Endpoint name, e.g. /predict
    #[arg(long)]
    api_name: Option<String>,

    /// Endpoint index, used when no api name is given
    #[arg(long)]
    fn_index: Option<usize>,

    /// Positional argument as JSON; bare words are sent as strings
    #[arg(long = "arg")]
    args: Vec<String>,

    /// Keyword argument as name=JSON
    #[arg(long = "kwarg")]
    kwargs: Vec<String>,

    /// Local file, appended after the --arg values
    #[arg(long = "file")]
    files: Vec<String>,

    /// Extra header as name=value
    #[arg(long = "header")]
    headers: Vec<String>,

    /// Print intermediate outputs and status changes
    #[arg(long)]
    stream: bool,

    /// Client options file (TOML); defaults come from QUEUE_CLIENT_* variables
    #[arg(long, env = "QUEUE_CLIENT_CONFIG")]
    config: Option<String>,

    #[arg(long, env = "QUEUE_CLIENT_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "QUEUE_CLIENT_PASSWORD")]
    password: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn options(&self) -> anyhow::Result<ClientOptions> {
        let mut options = match &self.config {
            Some(path) => ClientOptions::from_file(path)
                .with_context(|| format!("loading options from {}", path))?,
            None => ClientOptions::from_env()?,
        };
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.auth = Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        Ok(options)
    }

    fn call(&self) -> anyhow::Result<Call> {
        let mut call = Call::new();
        if let Some(api_name) = &self.api_name {
            call = call.api(api_name.clone());
        }
        if let Some(fn_index) = self.fn_index {
            call = call.fn_index(fn_index);
        }
        for arg in &self.args {
            call = call.arg(parse_value(arg));
        }
        for file in &self.files {
            call = call.arg(handle_file(file));
        }
        for kwarg in &self.kwargs {
            let (name, value) = split_pair(kwarg)?;
            call = call.kwarg(name, parse_value(value));
        }
        for header in &self.headers {
            let (name, value) = split_pair(header)?;
            call = call.header(name, value);
        }
        Ok(call)
    }
}

/// JSON when it parses, otherwise the raw string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn split_pair(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .ok_or_else(|| anyhow!("expected name=value, got {}", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = args.options()?;
    let call = args.call()?;

    let client = Client::connect(&args.src, options)
        .await
        .with_context(|| format!("connecting to {}", args.src))?;
    info!(protocol = %client.protocol(), version = %client.app_version(), "connected");

    let job = client.submit(call)?;
    if args.stream {
        let mut updates = std::pin::pin!(job.updates());
        while let Some(update) = updates.next().await {
            match update {
                Update::Status(status) => debug!(code = ?status.code, rank = ?status.rank, "status"),
                Update::Output(output) if !output.is_final => {
                    println!("{}", serde_json::to_string(&output.output)?);
                }
                Update::Output(_) => {}
            }
        }
    }

    let output = job.result(None).await?;
    println!("{}", serde_json::to_string_pretty(&output.into_value())?);
    client.close();
    Ok(())
}
