use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use sipdialer::{CallState, Config, SessionEvent, SessionEventKind, SipSession};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pause between DTMF digits
const INTER_DIGIT_GAP: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "sipdialer", version, about = "Register with a SIP trunk and place outbound calls")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, env = "SIPDIALER_CONFIG")]
    config: Option<PathBuf>,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register with the trunk and report the result
    Register,
    /// Send OPTIONS to the trunk
    Ping,
    /// Register, dial a number, send digits and hang up
    Call {
        /// Number or SIP URI to dial
        number: String,
        /// DTMF digits to send once the call is answered
        #[arg(short, long, default_value = "")]
        digits: String,
        /// How long to stay on the call after the digits
        #[arg(long, default_value_t = 10)]
        hold_secs: u64,
        /// How long to wait for an answer
        #[arg(long, default_value_t = 60)]
        answer_timeout_secs: u64,
    },
    /// Print the effective configuration with the password masked
    ShowConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::ShowConfig = cli.command {
        print!("{}", toml::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    // Longest a single transaction can stay unanswered before the engine gives up
    let transaction_wait = config.engine.timers().timeout_budget() + Duration::from_secs(1);

    let session = SipSession::start_udp(config).await?;
    let mut events = session.subscribe();
    info!("SIP session bound to {}", session.local_addr());

    let outcome = match cli.command {
        Commands::Register => register(&session, &mut events, cli.json, transaction_wait).await,
        Commands::Ping => ping(&session, &mut events, cli.json, transaction_wait).await,
        Commands::Call {
            number,
            digits,
            hold_secs,
            answer_timeout_secs,
        } => {
            let plan = CallPlan {
                number,
                digits,
                hold: Duration::from_secs(hold_secs),
                answer_timeout: Duration::from_secs(answer_timeout_secs),
                transaction_wait,
            };
            call(&session, &mut events, cli.json, plan).await
        }
        Commands::ShowConfig => Ok(()),
    };

    session.disconnect().await?;
    while let Ok(event) = events.try_recv() {
        print_event(&event, cli.json)?;
    }
    outcome
}

struct CallPlan {
    number: String,
    digits: String,
    hold: Duration,
    answer_timeout: Duration,
    transaction_wait: Duration,
}

async fn register(
    session: &SipSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    json: bool,
    limit: Duration,
) -> anyhow::Result<()> {
    session.register().await?;
    let outcome = wait_for(events, json, limit, |kind| {
        matches!(
            kind,
            SessionEventKind::Connected { .. } | SessionEventKind::RegistrationFailed { .. }
        )
    })
    .await?;

    if let SessionEventKind::RegistrationFailed { reason } = outcome {
        bail!("registration failed: {}", reason);
    }
    Ok(())
}

async fn ping(
    session: &SipSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    json: bool,
    limit: Duration,
) -> anyhow::Result<()> {
    session.test_connection().await?;
    let outcome = wait_for(events, json, limit, |kind| {
        matches!(kind, SessionEventKind::ConnectionTested { .. })
    })
    .await?;

    match outcome {
        SessionEventKind::ConnectionTested {
            reachable: false, ..
        } => bail!("trunk did not answer"),
        _ => Ok(()),
    }
}

async fn call(
    session: &SipSession,
    events: &mut broadcast::Receiver<SessionEvent>,
    json: bool,
    plan: CallPlan,
) -> anyhow::Result<()> {
    register(session, events, json, plan.transaction_wait).await?;

    session.place_call(&plan.number).await?;
    let answered = wait_for(events, json, plan.answer_timeout, |kind| {
        matches!(
            kind,
            SessionEventKind::CallEstablished { .. } | SessionEventKind::CallFailed { .. }
        )
    })
    .await?;
    if let SessionEventKind::CallFailed { reason, .. } = answered {
        bail!("call failed: {}", reason);
    }

    for digit in plan.digits.chars().filter(|c| !c.is_whitespace()) {
        session.send_digit(digit).await?;
        tokio::time::sleep(INTER_DIGIT_GAP).await;
    }

    let ended_remotely = tokio::select! {
        _ = tokio::time::sleep(plan.hold) => false,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, hanging up");
            false
        }
        ended = wait_for(events, json, plan.hold + Duration::from_secs(1), |kind| {
            matches!(kind, SessionEventKind::CallEnded { .. })
        }) => ended.is_ok(),
    };

    if !ended_remotely && session.status().await?.call_state == CallState::Established {
        session.hang_up().await?;
        wait_for(events, json, plan.transaction_wait, |kind| {
            matches!(kind, SessionEventKind::CallEnded { .. })
        })
        .await?;
    }
    Ok(())
}

/// Print events until `done` matches one, returning it
async fn wait_for<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    json: bool,
    limit: Duration,
    mut done: F,
) -> anyhow::Result<SessionEventKind>
where
    F: FnMut(&SessionEventKind) -> bool,
{
    let deadline = Instant::now() + limit;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                warn!("Missed {} session events", missed);
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => bail!("session engine stopped"),
            Err(_) => bail!("timed out after {:?}", limit),
        };
        print_event(&event, json)?;
        if done(&event.kind) {
            return Ok(event.kind);
        }
    }
}

fn print_event(event: &SessionEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
    } else {
        println!(
            "[{}] {}",
            event.metadata.occurred_at.format("%H:%M:%S%.3f"),
            event.kind
        );
    }
    Ok(())
}
