use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};
use myinfo::config::{AnyRedirect, MyInfoConfig};
use myinfo::MyInfoClient;
use myinfo_common::FileStore;
use openssl::x509::X509;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "MyInfo - Singpass person data client demo")]
struct Args {
    /// Directory holding myinfo_config.json and myinfo_certificate.p12
    #[arg(short = 'c', long, default_value = ".")]
    config_dir: PathBuf,

    /// Where the authorization state is persisted
    #[arg(short = 's', long, default_value = "myinfo-state.json")]
    state_file: PathBuf,

    /// MyInfo public certificate (PEM) to verify person payload signatures
    #[arg(long)]
    myinfo_cert: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with Singpass
    Login {
        /// Print the authorization URL and read the redirect URL from stdin
        /// instead of listening on the loopback redirect_uri
        #[arg(long)]
        manual: bool,

        /// Do not try to open a browser
        #[arg(long)]
        no_browser: bool,

        /// Seconds to wait for the redirect
        #[arg(long, default_value_t = 300)]
        timeout: u64,
    },
    /// Fetch the configured person attributes
    Person {
        /// Print the raw JSON record
        #[arg(long)]
        json: bool,
    },
    /// Use the refresh token to get a new access token
    Refresh,
    /// Show the stored authorization state
    Status,
    /// Discard the stored tokens
    Logout,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .with_env_filter(EnvFilter::from_env("MYINFO_LOG"))
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let config = MyInfoConfig::load(&args.config_dir, &AnyRedirect)?;
    let store = FileStore::new(&args.state_file);
    let mut client = MyInfoClient::new(config, store, reqwest::Client::new()).await?;
    if let Some(path) = &args.myinfo_cert {
        let pem = std::fs::read(path).into_diagnostic()?;
        let key = X509::from_pem(&pem)
            .and_then(|cert| cert.public_key())
            .into_diagnostic()?;
        client = client.with_verification_key(key);
    }

    match args.command {
        Command::Login {
            manual,
            no_browser,
            timeout,
        } => {
            let token = login(&client, manual, no_browser, timeout).await?;
            println!("logged in, access token ends in ...{}", tail(&token));
        }
        Command::Person { json } => {
            let person = client.get_person().await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(person.as_json()).into_diagnostic()?
                );
            } else {
                for name in client.configuration().attributes.split(',') {
                    let name = name.trim();
                    let value = person
                        .attribute(name)
                        .and_then(|a| a.display_value())
                        .unwrap_or_else(|| "-".into());
                    println!("{name:>16}: {value}");
                }
            }
        }
        Command::Refresh => {
            let token = client.refresh().await?;
            println!("refreshed, access token ends in ...{}", tail(&token));
        }
        Command::Status => {
            let config = client.configuration();
            println!("environment:  {}", config.environment);
            println!("client id:    {}", config.client_id);
            if let Some(endpoint) = client.authorization_endpoint().await? {
                println!("authorize at: {endpoint}");
            }
            let authorized = client.is_authorized().await?;
            println!("authorized:   {authorized}");
            if authorized {
                println!("expired:      {}", client.access_token_expired().await?);
            }
            if let Some(error) = client.auth_state().await?.authorization_error {
                println!("last error:   {error}");
            }
        }
        Command::Logout => {
            client.logout().await?;
            println!("logged out");
        }
    }
    Ok(())
}

async fn login(
    client: &MyInfoClient<reqwest::Client, FileStore>,
    manual: bool,
    no_browser: bool,
    timeout: u64,
) -> Result<smol_str::SmolStr> {
    #[cfg(feature = "loopback")]
    if !manual {
        let cfg = myinfo::loopback::LoopbackConfig {
            open_browser: !no_browser,
            timeout_ms: timeout * 1000,
        };
        return Ok(client.login_with_local_server(cfg).await?);
    }
    let _ = (manual, no_browser, timeout);

    println!(
        "To log in with Singpass, visit:\n{}\n",
        client.authorization_url().await?
    );
    println!("Paste the URL you were redirected to:");
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).into_diagnostic()?;
    let redirect = url::Url::parse(line.trim()).into_diagnostic()?;
    Ok(client.on_post_login_url(&redirect).await?)
}

fn tail(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &token[start..]
}
