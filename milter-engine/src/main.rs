use camino::Utf8PathBuf;
use clap::Parser;
use miette::{Context, IntoDiagnostic, Result};
use milter::ClientAddr;
use milter_engine::config::{Cfg, MilterOptions};
use milter_engine::{logging, InMemoryMessage, MilterEngine, Verdict};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tracing::info;
use ulid::Ulid;

/// Runs one mail transaction through the configured filters and prints
/// what they decided.
#[derive(Parser, Debug)]
#[command(name = "milter-probe", version, about)]
struct Args {
    /// Configuration file
    #[arg(long, default_value = "milter.toml")]
    config: Utf8PathBuf,

    /// Message to send, headers and body
    #[arg(long)]
    message: Utf8PathBuf,

    #[arg(long, default_value = "localhost")]
    helo: String,

    /// Envelope sender
    #[arg(long)]
    from: String,

    /// Envelope recipient, may be repeated
    #[arg(long, required = true)]
    rcpt: Vec<String>,

    /// Address of the simulated SMTP client
    #[arg(long)]
    client_addr: Option<SocketAddr>,

    #[arg(long, default_value = "localhost")]
    client_name: String,

    /// Option override, `key=value`. Wins over the configuration file.
    #[arg(short = 'O', value_name = "KEY=VALUE")]
    option: Vec<String>,

    /// Filters to use instead of the configured order
    #[arg(long, value_delimiter = ',')]
    filters: Vec<String>,
}

type Macros = BTreeMap<String, String>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut options = MilterOptions::default();
    for option in &args.option {
        options.set_assignment(option, true)?;
    }
    let cfg = Cfg::load(args.config.as_str(), &mut options)?;
    logging::init(&cfg.log)?;

    let defs = cfg.filter_defs()?;
    let mut engine = MilterEngine::new(&defs, cfg.engine_settings()?);
    if !args.filters.is_empty() {
        engine = engine.with_filter_list(&args.filters)?;
    }

    let raw = tokio::fs::read(&args.message)
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("reading {}", args.message))?;
    let mut message = InMemoryMessage::parse(&raw)?;
    message.sender = args.from.clone();

    let queue_id = Ulid::new().to_string();
    info!(%queue_id, filters = engine.filters().len(), "starting transaction");

    let mut macros = session_macros(&args, &queue_id);
    let verdict = transaction(&mut engine, &args, &mut message, &mut macros).await;
    engine.quit().await;

    println!("verdict: {}", verdict);
    if let Some(reply) = verdict.smtp_reply() {
        println!("reply:   {}", reply);
    }
    if verdict.is_continue() {
        println!("recipients: {}", message.recipients.join(", "));
        if let Some(reason) = message.quarantine_reason() {
            println!("quarantined: {}", reason);
        }
        println!();
        println!("{}", String::from_utf8_lossy(&message.render()));
    }
    Ok(())
}

fn session_macros(args: &Args, queue_id: &str) -> Macros {
    let mut macros = Macros::new();
    let client_ip = args
        .client_addr
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    macros.insert("j".to_string(), "milter-probe".to_string());
    macros.insert("daemon_name".to_string(), "milter-probe".to_string());
    macros.insert("i".to_string(), queue_id.to_string());
    macros.insert(
        "_".to_string(),
        format!("{} [{}]", args.client_name, client_ip),
    );
    macros.insert("client_addr".to_string(), client_ip);
    macros.insert("client_name".to_string(), args.client_name.clone());
    macros.insert("mail_addr".to_string(), args.from.clone());
    macros
}

fn report(phase: &str, verdict: &Verdict) {
    println!("{:<8} {}", phase, verdict);
}

async fn transaction(
    engine: &mut MilterEngine,
    args: &Args,
    message: &mut InMemoryMessage,
    macros: &mut Macros,
) -> Verdict {
    let client_addr = args
        .client_addr
        .map(ClientAddr::from)
        .unwrap_or(ClientAddr::Unknown);

    let verdict = engine.connect(&args.client_name, &client_addr, &*macros).await;
    report("connect", &verdict);
    if !verdict.is_continue() {
        return verdict;
    }

    let verdict = engine.helo(&args.helo, &*macros).await;
    report("helo", &verdict);
    if !verdict.is_continue() {
        return verdict;
    }

    let verdict = engine.mail_from(&[args.from.as_str()], &*macros).await;
    report("mail", &verdict);
    if !verdict.is_continue() {
        engine.abort().await;
        return verdict;
    }

    let mut last_refusal = None;
    for rcpt in &args.rcpt {
        macros.insert("rcpt_addr".to_string(), rcpt.clone());
        let verdict = engine.rcpt_to(&[rcpt.as_str()], &*macros).await;
        report("rcpt", &verdict);
        if verdict.is_continue() {
            message.recipients.push(rcpt.clone());
        } else {
            last_refusal = Some(verdict);
        }
    }
    if message.recipients.is_empty() {
        engine.abort().await;
        return last_refusal.unwrap_or(Verdict::Reject);
    }

    let verdict = engine.data(message).await;
    report("data", &verdict);
    verdict
}
